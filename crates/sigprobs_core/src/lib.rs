pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod html;
pub mod links;
pub mod lint;
pub mod model;
pub mod replica;
pub mod report;
pub mod site;
pub mod subst;
pub mod suite;
pub mod user_check;
pub mod wikitext;

#[cfg(test)]
pub(crate) mod testing;

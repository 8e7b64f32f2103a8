//! A small wikitext tokenizer covering what signature checks look at: wikilinks,
//! templates, template arguments, HTML-like tags, external links and comments.
//! Anything it does not recognize stays literal text.

use std::cell::RefCell;
use std::collections::HashMap;

/// Tags whose contents are never parsed as markup.
const OPAQUE_TAGS: &[&str] = &["nowiki", "pre", "math", "syntaxhighlight", "source"];

const BRACKETED_PROTOCOLS: &[&str] = &[
    "http://", "https://", "ftp://", "ftps://", "irc://", "ircs://", "news:", "mailto:", "//",
];

const FREE_PROTOCOLS: &[&str] = &[
    "http://", "https://", "ftp://", "ftps://", "irc://", "ircs://", "mailto:",
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Wikicode {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Comment(String),
    WikiLink(WikiLink),
    Template(Template),
    Argument(Argument),
    Tag(Tag),
    ExternalLink(ExternalLink),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiLink {
    /// Raw target, fragment and surrounding whitespace included.
    pub title: String,
    /// Raw display text after the first top-level pipe.
    pub text: Option<String>,
    /// Byte offset of the opening `[[` in the parsed source.
    pub start: usize,
    title_code: Wikicode,
    text_code: Option<Wikicode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// Template or parser-function name, trimmed.
    pub name: String,
    pub start: usize,
    name_code: Wikicode,
    params: Vec<Wikicode>,
}

impl Template {
    pub fn params(&self) -> &[Wikicode] {
        &self.params
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    default: Option<Wikicode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Lowercased tag name.
    pub name: String,
    pub start: usize,
    pub closing: bool,
    pub self_closing: bool,
    /// Unparsed contents of `nowiki`-like tags.
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLink {
    pub url: String,
    pub title: Option<String>,
    pub bracketed: bool,
    title_code: Option<Wikicode>,
}

pub fn parse(source: &str) -> Wikicode {
    Parser::new(source).parse_nodes(0, source.len())
}

impl Wikicode {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Every wikilink, nested ones included, in document order.
    pub fn wikilinks(&self) -> Vec<&WikiLink> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let Node::WikiLink(link) = node {
                out.push(link);
            }
        });
        out
    }

    pub fn templates(&self) -> Vec<&Template> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let Node::Template(template) = node {
                out.push(template);
            }
        });
        out
    }

    /// Literal text spans; markup syntax, comments and tag attributes are excluded.
    pub fn text_nodes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let Node::Text(text) = node {
                out.push(text.as_str());
            }
        });
        out
    }

    pub fn tags(&self) -> Vec<&Tag> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let Node::Tag(tag) = node {
                out.push(tag);
            }
        });
        out
    }

    pub fn external_links(&self) -> Vec<&ExternalLink> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let Node::ExternalLink(link) = node {
                out.push(link);
            }
        });
        out
    }

    fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Node)) {
        for node in &self.nodes {
            visit(node);
            match node {
                Node::WikiLink(link) => {
                    link.title_code.walk(visit);
                    if let Some(text) = &link.text_code {
                        text.walk(visit);
                    }
                }
                Node::Template(template) => {
                    template.name_code.walk(visit);
                    for param in &template.params {
                        param.walk(visit);
                    }
                }
                Node::Argument(argument) => {
                    if let Some(default) = &argument.default {
                        default.walk(visit);
                    }
                }
                Node::ExternalLink(link) => {
                    if let Some(title) = &link.title_code {
                        title.walk(visit);
                    }
                }
                Node::Text(_) | Node::Comment(_) | Node::Tag(_) => {}
            }
        }
    }
}

/// Bracket matches are memoized per `(start, limit)`, failures included, so
/// unclosed runs of `{` or `[[` are resolved once instead of rescanned.
struct Parser<'s> {
    src: &'s str,
    brace_matches: RefCell<HashMap<(usize, usize), Option<BraceBounds>>>,
    link_matches: RefCell<HashMap<(usize, usize), Option<(usize, Option<usize>)>>>,
}

impl<'s> Parser<'s> {
    fn new(src: &'s str) -> Self {
        Self {
            src,
            brace_matches: RefCell::default(),
            link_matches: RefCell::default(),
        }
    }

    fn parse_nodes(&self, from: usize, to: usize) -> Wikicode {
        let bytes = self.src.as_bytes();
        let mut nodes = Vec::new();
        let mut text_start = from;
        let mut cursor = from;

        while cursor < to {
            let rest = &self.src[cursor..to];
            let parsed = match bytes[cursor] {
                b'<' => self.comment(cursor, to).or_else(|| self.tag(cursor, to)),
                b'{' if rest.starts_with("{{") => self.braces(cursor, to),
                b'[' if rest.starts_with("[[") => self.wikilink(cursor, to),
                b'[' => self.bracketed_link(cursor, to),
                byte if byte.is_ascii_alphabetic() => self.free_link(cursor, to),
                _ => None,
            };

            match parsed {
                Some((node, end)) => {
                    push_text(&mut nodes, &self.src[text_start..cursor]);
                    nodes.push(node);
                    cursor = end;
                    text_start = end;
                }
                None => cursor = self.next_char(cursor),
            }
        }
        push_text(&mut nodes, &self.src[text_start..to]);

        Wikicode { nodes }
    }

    fn next_char(&self, at: usize) -> usize {
        at + self.src[at..].chars().next().map_or(1, char::len_utf8)
    }

    /// First position in `from..to` where `needle` starts outside nested braces,
    /// links, comments and opaque tags.
    fn find_top_level(&self, from: usize, to: usize, needle: &str) -> Option<usize> {
        let mut cursor = from;
        while cursor < to {
            let rest = &self.src[cursor..to];
            if rest.starts_with(needle) {
                return Some(cursor);
            }
            let skip = if rest.starts_with("<!--") {
                Some(rest.find("-->").map_or(to, |end| cursor + end + 3))
            } else if rest.starts_with("{{") {
                self.braces_bounds(cursor, to).map(|bounds| bounds.end)
            } else if rest.starts_with("[[") {
                self.wikilink_bounds(cursor, to).map(|(close, _)| close + 2)
            } else if rest.starts_with('<') {
                self.tag(cursor, to).and_then(|(node, end)| match node {
                    Node::Tag(Tag { body: Some(_), .. }) => Some(end),
                    _ => None,
                })
            } else {
                None
            };
            cursor = match skip {
                Some(end) => end,
                None => self.next_char(cursor),
            };
        }
        None
    }

    fn split_top_level(&self, from: usize, to: usize) -> Vec<(usize, usize)> {
        let mut parts = Vec::new();
        let mut start = from;
        while let Some(pipe) = self.find_top_level(start, to, "|") {
            parts.push((start, pipe));
            start = pipe + 1;
        }
        parts.push((start, to));
        parts
    }

    fn comment(&self, cursor: usize, to: usize) -> Option<(Node, usize)> {
        let rest = &self.src[cursor..to];
        if !rest.starts_with("<!--") {
            return None;
        }
        let end = rest[4..].find("-->").map_or(to, |offset| cursor + 4 + offset + 3);
        let body_end = if end == to && !rest.ends_with("-->") {
            to
        } else {
            end - 3
        };
        Some((
            Node::Comment(self.src[cursor + 4..body_end.max(cursor + 4)].to_string()),
            end,
        ))
    }

    fn tag(&self, cursor: usize, to: usize) -> Option<(Node, usize)> {
        let bytes = self.src.as_bytes();
        let mut index = cursor + 1;
        let closing = bytes.get(index).copied() == Some(b'/');
        if closing {
            index += 1;
        }
        let name_start = index;
        if index >= to || !bytes[index].is_ascii_alphabetic() {
            return None;
        }
        while index < to && bytes[index].is_ascii_alphanumeric() {
            index += 1;
        }
        if index < to
            && !matches!(
                bytes[index],
                b' ' | b'\t' | b'\n' | b'\r' | b'>' | b'/'
            )
        {
            return None;
        }

        let name = self.src[name_start..index].to_ascii_lowercase();
        let close = find_tag_end(&self.src[..to], index)?;
        let self_closing = !closing && bytes[close - 1] == b'/';
        let mut end = close + 1;
        let mut body = None;

        if !closing && !self_closing && OPAQUE_TAGS.contains(&name.as_str()) {
            let closer = format!("</{name}");
            let lowered = self.src[end..to].to_ascii_lowercase();
            match lowered.find(&closer) {
                Some(offset) => {
                    body = Some(self.src[end..end + offset].to_string());
                    end = find_tag_end(&self.src[..to], end + offset + closer.len())
                        .map_or(to, |gt| gt + 1);
                }
                None => {
                    body = Some(self.src[end..to].to_string());
                    end = to;
                }
            }
        }

        Some((
            Node::Tag(Tag {
                name,
                start: cursor,
                closing,
                self_closing,
                body,
            }),
            end,
        ))
    }

    fn braces_bounds(&self, cursor: usize, to: usize) -> Option<BraceBounds> {
        let cached = self.brace_matches.borrow().get(&(cursor, to)).copied();
        if let Some(bounds) = cached {
            return bounds;
        }
        let bounds = self.match_braces(cursor, to);
        self.brace_matches.borrow_mut().insert((cursor, to), bounds);
        bounds
    }

    fn match_braces(&self, cursor: usize, to: usize) -> Option<BraceBounds> {
        let run = self.src.as_bytes()[cursor..to]
            .iter()
            .take_while(|byte| **byte == b'{')
            .count();
        if run >= 3
            && let Some(close) = self.find_top_level(cursor + 3, to, "}}}")
        {
            return Some(BraceBounds {
                body: cursor + 3,
                close,
                end: close + 3,
                argument: true,
            });
        }
        if run < 2 {
            return None;
        }
        let close = self.find_top_level(cursor + 2, to, "}}")?;
        Some(BraceBounds {
            body: cursor + 2,
            close,
            end: close + 2,
            argument: false,
        })
    }

    fn braces(&self, cursor: usize, to: usize) -> Option<(Node, usize)> {
        let bounds = self.braces_bounds(cursor, to)?;
        let parts = self.split_top_level(bounds.body, bounds.close);
        let (name_start, name_end) = parts[0];
        let name = self.src[name_start..name_end].trim();
        if name.is_empty() {
            return None;
        }

        let node = if bounds.argument {
            Node::Argument(Argument {
                name: name.to_string(),
                default: parts
                    .get(1)
                    .map(|(start, end)| self.parse_nodes(*start, *end)),
            })
        } else {
            Node::Template(Template {
                name: name.to_string(),
                start: cursor,
                name_code: self.parse_nodes(name_start, name_end),
                params: parts[1..]
                    .iter()
                    .map(|(start, end)| self.parse_nodes(*start, *end))
                    .collect(),
            })
        };
        Some((node, bounds.end))
    }

    /// Position of the closing `]]` and of the first top-level pipe, if any.
    fn wikilink_bounds(&self, cursor: usize, to: usize) -> Option<(usize, Option<usize>)> {
        let cached = self.link_matches.borrow().get(&(cursor, to)).copied();
        if let Some(bounds) = cached {
            return bounds;
        }
        let bounds = self.match_wikilink(cursor, to);
        self.link_matches.borrow_mut().insert((cursor, to), bounds);
        bounds
    }

    fn match_wikilink(&self, cursor: usize, to: usize) -> Option<(usize, Option<usize>)> {
        let body = cursor + 2;
        let close = self.find_top_level(body, to, "]]")?;
        let pipe = self.find_top_level(body, close, "|");
        let title = &self.src[body..pipe.unwrap_or(close)];
        if title.trim().is_empty() || title.contains('\n') {
            return None;
        }
        Some((close, pipe))
    }

    fn wikilink(&self, cursor: usize, to: usize) -> Option<(Node, usize)> {
        let (close, pipe) = self.wikilink_bounds(cursor, to)?;
        let body = cursor + 2;
        let title_end = pipe.unwrap_or(close);
        let text_range = pipe.map(|pipe| (pipe + 1, close));

        Some((
            Node::WikiLink(WikiLink {
                title: self.src[body..title_end].to_string(),
                text: text_range.map(|(start, end)| self.src[start..end].to_string()),
                start: cursor,
                title_code: self.parse_nodes(body, title_end),
                text_code: text_range.map(|(start, end)| self.parse_nodes(start, end)),
            }),
            close + 2,
        ))
    }

    fn bracketed_link(&self, cursor: usize, to: usize) -> Option<(Node, usize)> {
        let body = cursor + 1;
        let rest = &self.src[body..to];
        let protocol = BRACKETED_PROTOCOLS
            .iter()
            .find(|protocol| starts_with_ignore_case(rest, protocol))?;
        let close = body + rest.find(']')?;
        let inner = &self.src[body..close];
        if inner.contains('\n') {
            return None;
        }

        let (url_end, title_start) = match inner.find([' ', '\t']) {
            Some(space) => (body + space, Some(body + space + 1)),
            None => (close, None),
        };
        if url_end <= body + protocol.len() {
            return None;
        }

        Some((
            Node::ExternalLink(ExternalLink {
                url: self.src[body..url_end].to_string(),
                title: title_start.map(|start| self.src[start..close].to_string()),
                bracketed: true,
                title_code: title_start.map(|start| self.parse_nodes(start, close)),
            }),
            close + 1,
        ))
    }

    fn free_link(&self, cursor: usize, to: usize) -> Option<(Node, usize)> {
        let bytes = self.src.as_bytes();
        if cursor > 0 && (bytes[cursor - 1].is_ascii_alphanumeric() || bytes[cursor - 1] == b'_') {
            return None;
        }
        let rest = &self.src[cursor..to];
        let protocol = FREE_PROTOCOLS
            .iter()
            .find(|protocol| starts_with_ignore_case(rest, protocol))?;

        let url_start = cursor + protocol.len();
        let mut end = url_start;
        while end < to {
            let byte = bytes[end];
            if byte.is_ascii_whitespace()
                || matches!(byte, b'[' | b']' | b'<' | b'>' | b'"' | b'{' | b'}' | b'|')
                || (byte == b'\'' && bytes.get(end + 1).copied() == Some(b'\''))
            {
                break;
            }
            end += 1;
        }
        while end > url_start && matches!(bytes[end - 1], b'.' | b',' | b';' | b':' | b'!' | b'?') {
            end -= 1;
        }
        if end > url_start && bytes[end - 1] == b')' && !self.src[cursor..end].contains('(') {
            end -= 1;
        }
        if end == url_start {
            return None;
        }

        Some((
            Node::ExternalLink(ExternalLink {
                url: self.src[cursor..end].to_string(),
                title: None,
                bracketed: false,
                title_code: None,
            }),
            end,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
struct BraceBounds {
    body: usize,
    close: usize,
    end: usize,
    argument: bool,
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Node::Text(previous)) = nodes.last_mut() {
        previous.push_str(text);
    } else {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn find_tag_end(html: &str, start: usize) -> Option<usize> {
    let bytes = html.as_bytes();
    let mut index = start;
    let mut quote = None::<u8>;
    while index < bytes.len() {
        let byte = bytes[index];
        if let Some(active) = quote {
            if byte == active {
                quote = None;
            }
            index += 1;
            continue;
        }
        if byte == b'"' || byte == b'\'' {
            quote = Some(byte);
            index += 1;
            continue;
        }
        if byte == b'>' {
            return Some(index);
        }
        if byte == b'<' {
            return None;
        }
        index += 1;
    }
    None
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len() && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

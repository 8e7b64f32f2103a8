use std::collections::HashMap;
use std::sync::OnceLock;

use entities::ENTITIES;

/// Longest name run considered after `&`.
const MAX_NAME_CHARS: usize = 32;

/// Names that also decode without a trailing `;`.
const LEGACY_NAMES: &[&str] = &[
    "AElig", "AMP", "Aacute", "Acirc", "Agrave", "Aring", "Atilde", "Auml", "COPY", "Ccedil",
    "ETH", "Eacute", "Ecirc", "Egrave", "Euml", "GT", "Iacute", "Icirc", "Igrave", "Iuml", "LT",
    "Ntilde", "Oacute", "Ocirc", "Ograve", "Oslash", "Otilde", "Ouml", "QUOT", "REG", "THORN",
    "Uacute", "Ucirc", "Ugrave", "Uuml", "Yacute", "aacute", "acirc", "acute", "aelig", "agrave",
    "amp", "aring", "atilde", "auml", "brvbar", "ccedil", "cedil", "cent", "copy", "curren", "deg",
    "divide", "eacute", "ecirc", "egrave", "eth", "euml", "frac12", "frac14", "frac34", "gt",
    "iacute", "icirc", "iexcl", "igrave", "iquest", "iuml", "laquo", "lt", "macr", "micro",
    "middot", "nbsp", "not", "ntilde", "oacute", "ocirc", "ograve", "ordf", "ordm", "oslash",
    "otilde", "ouml", "para", "plusmn", "pound", "quot", "raquo", "reg", "sect", "shy", "sup1",
    "sup2", "sup3", "szlig", "thorn", "times", "uacute", "ucirc", "ugrave", "uml", "uuml",
    "yacute", "yen", "yuml",
];

/// Windows-1252 meanings of the C1 range, as browsers decode `&#128;` and friends.
const C1_REMAP: [char; 32] = [
    '\u{20ac}', '\u{81}', '\u{201a}', '\u{192}', '\u{201e}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{2c6}', '\u{2030}', '\u{160}', '\u{2039}', '\u{152}', '\u{8d}', '\u{17d}', '\u{8f}',
    '\u{90}', '\u{2018}', '\u{2019}', '\u{201c}', '\u{201d}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{2dc}', '\u{2122}', '\u{161}', '\u{203a}', '\u{153}', '\u{9d}', '\u{17e}', '\u{178}',
];

/// Named references keyed without the leading `&`, e.g. `"verbar;"`.
fn named_references() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        ENTITIES
            .iter()
            .map(|entity| (entity.entity.trim_start_matches('&'), entity.characters))
            .collect()
    })
}

/// Decodes HTML5 character references the way browsers do: the full named
/// set, numeric references with or without `;`, and the legacy names that
/// may omit it (`&amp x`). Anything else is left untouched.
pub fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find('&') {
        out.push_str(&rest[..at]);
        let candidate = &rest[at + 1..];
        let decoded = if candidate.starts_with('#') {
            decode_numeric(candidate)
        } else {
            decode_named(candidate)
        };
        match decoded {
            Some((replacement, consumed)) => {
                out.push_str(&replacement);
                rest = &candidate[consumed..];
            }
            None => {
                out.push('&');
                rest = candidate;
            }
        }
    }
    out.push_str(rest);
    out
}

/// `candidate` is the text after `&`, starting with `#`. Returns the replacement
/// and the bytes consumed after `&`.
fn decode_numeric(candidate: &str) -> Option<(String, usize)> {
    let body = &candidate[1..];
    let (digits, radix, prefix) = match body.strip_prefix(['x', 'X']) {
        Some(hex) => (hex, 16, 2),
        None => (body, 10, 1),
    };
    let len = digits
        .bytes()
        .take_while(|byte| {
            if radix == 16 {
                byte.is_ascii_hexdigit()
            } else {
                byte.is_ascii_digit()
            }
        })
        .count();
    if len == 0 {
        return None;
    }
    let mut consumed = prefix + len;
    if digits[len..].starts_with(';') {
        consumed += 1;
    }

    let code = u32::from_str_radix(&digits[..len], radix).unwrap_or(u32::MAX);
    Some((numeric_replacement(code), consumed))
}

fn numeric_replacement(code: u32) -> String {
    match code {
        0 => '\u{fffd}'.to_string(),
        0x0d => '\r'.to_string(),
        0x80..=0x9f => C1_REMAP[(code - 0x80) as usize].to_string(),
        0xd800..=0xdfff | 0x11_0000.. => '\u{fffd}'.to_string(),
        0x01..=0x08 | 0x0b | 0x0e..=0x1f | 0x7f | 0xfdd0..=0xfdef => String::new(),
        _ if code & 0xfffe == 0xfffe => String::new(),
        _ => char::from_u32(code).map(String::from).unwrap_or_default(),
    }
}

fn decode_named(candidate: &str) -> Option<(String, usize)> {
    let run_end = candidate
        .char_indices()
        .take(MAX_NAME_CHARS)
        .find(|(_, ch)| matches!(ch, '\t' | '\n' | '\x0c' | ' ' | '<' | '&' | '#' | ';'))
        .map_or_else(
            || {
                candidate
                    .char_indices()
                    .nth(MAX_NAME_CHARS)
                    .map_or(candidate.len(), |(index, _)| index)
            },
            |(index, _)| index,
        );
    let name = &candidate[..run_end];
    if name.is_empty() {
        return None;
    }

    let table = named_references();
    if candidate[run_end..].starts_with(';')
        && let Some(characters) = table.get(&candidate[..=run_end])
    {
        return Some(((*characters).to_string(), run_end + 1));
    }

    (2..=name.len())
        .rev()
        .filter(|len| name.is_char_boundary(*len))
        .find(|len| LEGACY_NAMES.contains(&&name[..*len]))
        .and_then(|len| {
            table
                .get(format!("{};", &name[..len]).as_str())
                .map(|characters| ((*characters).to_string(), len))
        })
}

use anyhow::{anyhow, bail, Result};
use base64::Engine;
use mail_parser::{Address, Message, MessageParser, MessagePart, MimeHeaders, PartType};

use crate::imap::fetch::FetchArg;
use crate::mail::FetchItem;

/// Builds the BODYSTRUCTURE string for a raw message.
pub fn bodystructure(raw: &[u8]) -> Result<String> {
    let msg = parse(raw)?;
    Ok(part_structure(&msg, 0))
}

/// Builds the ENVELOPE string for a raw message.
pub fn envelope(raw: &[u8]) -> Result<String> {
    let msg = parse(raw)?;
    Ok(envelope_of(&msg))
}

fn parse(raw: &[u8]) -> Result<Message<'_>> {
    MessageParser::default()
        .parse(raw)
        .ok_or_else(|| anyhow!("unparseable message"))
}

/// Emits the structure of one MIME part.
///
/// multipart/*: the children in order, then the quoted subtype.
/// message/rfc822: default fields, embedded envelope, embedded body
/// structure, line count. text/*: default fields plus the line count.
/// Anything else: the default fields alone.
fn part_structure(msg: &Message<'_>, id: usize) -> String {
    let part = &msg.parts[id];

    match &part.body {
        PartType::Multipart(children) => {
            let mut ret = String::from("(");
            for child in children {
                ret.push_str(&part_structure(msg, *child));
            }
            let subtype = part
                .content_type()
                .and_then(|ct| ct.subtype())
                .unwrap_or("mixed");
            ret.push(' ');
            ret.push_str(&up(subtype));
            ret.push(')');
            ret
        }
        PartType::Message(embedded) => {
            let lines = count_lines(part_raw(msg, part));
            format!(
                "({} {} {} {})",
                default_fields(msg, part).join(" "),
                envelope_of(embedded),
                part_structure(embedded, 0),
                quote_or_nil(&lines.to_string()),
            )
        }
        PartType::Text(_) | PartType::Html(_) => {
            let lines = count_lines(part_raw(msg, part));
            format!("({} {})", default_fields(msg, part).join(" "), lines)
        }
        _ => format!("({})", default_fields(msg, part).join(" ")),
    }
}

/// The common fields of a non-multipart part: quoted upper-cased type and
/// subtype, the parameter list, content-id, description, encoding, size.
fn default_fields(msg: &Message<'_>, part: &MessagePart<'_>) -> Vec<String> {
    let (ctype, subtype) = match part.content_type() {
        Some(ct) => (
            ct.ctype().to_string(),
            ct.subtype().unwrap_or("plain").to_string(),
        ),
        None => ("text".to_string(), "plain".to_string()),
    };

    let mut params = Vec::new();
    if let Some(ct) = part.content_type() {
        if let Some(attributes) = &ct.attributes {
            for (key, value) in attributes {
                params.push(format!("{} {}", up(key), up(value)));
            }
        }
    }

    vec![
        up(&ctype),
        up(&subtype),
        format!("({})", params.join(" ")),
        up(part.content_id().unwrap_or("")),
        up(part.content_description().unwrap_or("")),
        up(part.content_transfer_encoding().unwrap_or("")),
        part_raw(msg, part).len().to_string(),
    ]
}

/// The ENVELOPE of a message: date, subject as a literal, the six address
/// lists, in-reply-to, and the message-id with angle brackets stripped.
fn envelope_of(msg: &Message<'_>) -> String {
    let date = msg
        .date()
        .map(|d| d.to_rfc822())
        .unwrap_or_default();

    let mut message_id = msg.message_id().unwrap_or("");
    message_id = message_id
        .strip_prefix('<')
        .and_then(|m| m.strip_suffix('>'))
        .unwrap_or(message_id);

    let fields = [
        quote(&date),
        literalify(msg.subject().unwrap_or("")),
        address_list(msg.from()),
        address_list(msg.sender()),
        address_list(msg.reply_to()),
        address_list(msg.to()),
        address_list(msg.cc()),
        address_list(msg.bcc()),
        quote(msg.in_reply_to().as_text().unwrap_or("")),
        quote(message_id),
    ];
    format!("({})", fields.join(" "))
}

/// A parenthesized list of `(name NIL local domain)` tuples, or NIL when
/// the header is absent.
fn address_list(addr: Option<&Address<'_>>) -> String {
    let addrs: Vec<_> = match addr {
        None => return "NIL".to_string(),
        Some(Address::List(list)) => list.iter().collect(),
        Some(Address::Group(groups)) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };

    let mut tuples = Vec::with_capacity(addrs.len());
    for a in addrs {
        let Some(address) = a.address() else { continue };
        let Some((local, domain)) = address.split_once('@') else {
            continue;
        };
        tuples.push(format!(
            "({} NIL {} {})",
            quote_or_nil(a.name().unwrap_or("")),
            quote_or_nil(local),
            quote_or_nil(domain),
        ));
    }
    format!("({})", tuples.join(" "))
}

/// Extracts the value for a BODY[...] fetch argument from a raw message
/// and renders it with its response key.
pub fn fetch_body_item(raw: &[u8], arg: &FetchArg) -> Result<FetchItem> {
    let msg = parse(raw)?;

    // Narrow down to the requested part; an empty path targets the whole
    // message.
    let (header_bytes, body_bytes, whole_bytes) = if arg.part.is_empty() {
        let root = &msg.parts[0];
        let split = root.offset_body.min(raw.len());
        (&raw[..split], &raw[split..], raw)
    } else {
        let part = locate_part(&msg, &arg.part)?;
        let header = slice(raw, part.offset_header, part.offset_body);
        let body = slice(raw, part.offset_body, part.offset_end);
        (header, body, slice(raw, part.offset_header, part.offset_end))
    };

    let key_pattern = {
        let mut key = String::from("BODY[");
        let part_strings: Vec<String> = arg.part.iter().map(ToString::to_string).collect();
        key.push_str(&part_strings.join("."));
        if !arg.section.is_empty() && !part_strings.is_empty() {
            key.push('.');
        }
        key
    };

    let (key, value) = match arg.section.as_str() {
        "" => {
            let content = if arg.part.is_empty() {
                whole_bytes.to_vec()
            } else {
                decoded_body(&msg, &arg.part, body_bytes)
            };
            (format!("{}]", key_pattern), content)
        }
        "HEADER" => (format!("{}HEADER]", key_pattern), header_bytes.to_vec()),
        "HEADER.FIELDS" => {
            let value = selected_headers(&msg, &arg.part, &arg.fields, false)?;
            (
                format!("{}HEADER.FIELDS ({})]", key_pattern, arg.fields.join(" ")),
                value,
            )
        }
        "HEADER.FIELDS.NOT" => {
            let value = selected_headers(&msg, &arg.part, &arg.fields, true)?;
            (
                format!("{}HEADER.FIELDS.NOT ({})]", key_pattern, arg.fields.join(" ")),
                value,
            )
        }
        "TEXT" => (format!("{}TEXT]", key_pattern), body_bytes.to_vec()),
        "MIME" => bail!("MIME is unsupported"),
        other => bail!("unsupported section {:?}", other),
    };

    let mut key = key;
    if arg.offset >= 0 {
        key.push('<');
        key.push_str(&arg.offset.to_string());
        if arg.length > 0 {
            key.push('.');
            key.push_str(&arg.length.to_string());
        }
        key.push('>');
    }

    // Apply the partial range, clamped to the value.
    let from = if arg.offset >= 0 { arg.offset as usize } else { 0 };
    let from = from.min(value.len());
    let to = if arg.length != 0 {
        (from + arg.length as usize).min(value.len())
    } else {
        value.len()
    };

    let rendered = if from == to {
        "\"\"".to_string()
    } else {
        literalify(&String::from_utf8_lossy(&value[from..to]))
    };

    Ok(FetchItem::single(key, rendered))
}

/// Walks a dot-separated part path. Every message has at least one part:
/// BODY[1] of a non-multipart message addresses its whole body.
fn locate_part<'a>(msg: &'a Message<'a>, path: &[u32]) -> Result<&'a MessagePart<'a>> {
    let mut current = 0usize;

    for (i, component) in path.iter().enumerate() {
        match &msg.parts[current].body {
            PartType::Multipart(children) => {
                let idx = (*component as usize)
                    .checked_sub(1)
                    .ok_or_else(|| anyhow!("invalid part number 0"))?;
                current = *children
                    .get(idx)
                    .ok_or_else(|| anyhow!("no such part: {}", component))?;
            }
            _ => {
                if path.len() == 1 && path[0] == 1 && i == 0 {
                    return Ok(&msg.parts[0]);
                }
                bail!("invalid hierarchy");
            }
        }
    }
    Ok(&msg.parts[current])
}

/// Body bytes of a located part, with base64 transfer encoding undone.
fn decoded_body(msg: &Message<'_>, path: &[u32], body_bytes: &[u8]) -> Vec<u8> {
    let is_base64 = locate_part(msg, path)
        .ok()
        .and_then(|p| p.content_transfer_encoding())
        .map(|e| e.eq_ignore_ascii_case("base64"))
        .unwrap_or(false);

    if is_base64 {
        let compact: Vec<u8> = body_bytes
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(compact) {
            return decoded;
        }
    }
    body_bytes.to_vec()
}

/// Rebuilds a header block keeping (or, when `invert`, dropping) the named
/// fields.
fn selected_headers(
    msg: &Message<'_>,
    path: &[u32],
    fields: &[String],
    invert: bool,
) -> Result<Vec<u8>> {
    let headers = if path.is_empty() {
        &msg.parts[0].headers
    } else {
        &locate_part(msg, path)?.headers
    };

    let mut out = Vec::new();
    for header in headers {
        let name = header.name.as_str();
        let listed = fields.iter().any(|f| f.eq_ignore_ascii_case(name));
        if listed == invert {
            continue;
        }
        let raw: &[u8] = msg.raw_message.as_ref();
        let value = slice(raw, header.offset_start, header.offset_end);
        out.extend_from_slice(name.as_bytes());
        out.push(b':');
        // The raw slice keeps the original folding and trailing CRLF.
        out.extend_from_slice(value);
    }
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

fn part_raw<'a>(msg: &'a Message<'_>, part: &MessagePart<'_>) -> &'a [u8] {
    slice(msg.raw_message.as_ref(), part.offset_body, part.offset_end)
}

fn slice(raw: &[u8], from: usize, to: usize) -> &[u8] {
    let from = from.min(raw.len());
    let to = to.clamp(from, raw.len());
    &raw[from..to]
}

fn count_lines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\n').count()
}

fn literalify(s: &str) -> String {
    format!("{{{}}}\r\n{}", s.len(), s)
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s)
}

fn quote_or_nil(s: &str) -> String {
    if s.is_empty() {
        "NIL".to_string()
    } else {
        quote(s)
    }
}

fn up(s: &str) -> String {
    quote_or_nil(&s.to_uppercase())
}

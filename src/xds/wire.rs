// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Editing of encoded protobuf messages without decoding them. Fields that are not
//! touched keep their exact bytes, including fields our message types do not know.

use prost::encoding::{WireType, decode_key, decode_varint, encode_key, encode_varint};

use super::Error;

struct Field<'a> {
    tag: u32,
    /// The whole field: key, length prefix and payload.
    raw: &'a [u8],
    /// Payload of a length-delimited field.
    body: Option<&'a [u8]>,
}

fn take<'a>(buf: &mut &'a [u8], n: usize, tag: u32) -> Result<&'a [u8], Error> {
    if buf.len() < n {
        return Err(Error::Truncated(tag));
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

fn next_field<'a>(buf: &mut &'a [u8]) -> Result<Field<'a>, Error> {
    let start: &'a [u8] = *buf;
    let (tag, wire_type) = decode_key(buf)?;
    let body = match wire_type {
        WireType::Varint => {
            decode_varint(buf)?;
            None
        }
        WireType::SixtyFourBit => {
            take(buf, 8, tag)?;
            None
        }
        WireType::ThirtyTwoBit => {
            take(buf, 4, tag)?;
            None
        }
        WireType::LengthDelimited => {
            let len = usize::try_from(decode_varint(buf)?).map_err(|_| Error::Truncated(tag))?;
            Some(take(buf, len, tag)?)
        }
        WireType::StartGroup | WireType::EndGroup => return Err(Error::Group(tag)),
    };
    let raw = &start[..start.len() - buf.len()];
    Ok(Field { tag, raw, body })
}

/// Applies `f` to every embedded message reached by following `path`, a chain of field
/// numbers, and re-frames the results. Everything off the path is copied as is.
pub fn rewrite_message(
    buf: &[u8],
    path: &[u32],
    f: &dyn Fn(&[u8]) -> Result<Vec<u8>, Error>,
) -> Result<Vec<u8>, Error> {
    let Some((&tag, rest)) = path.split_first() else {
        return f(buf);
    };
    let mut out = Vec::with_capacity(buf.len());
    let mut cur = buf;
    while !cur.is_empty() {
        let field = next_field(&mut cur)?;
        match field.body {
            Some(body) if field.tag == tag => {
                let inner = rewrite_message(body, rest, f)?;
                encode_key(tag, WireType::LengthDelimited, &mut out);
                encode_varint(inner.len() as u64, &mut out);
                out.extend_from_slice(&inner);
            }
            _ => out.extend_from_slice(field.raw),
        }
    }
    Ok(out)
}

/// Drops every occurrence of the fields numbered `tags` and appends `replacement`, which
/// holds the new encoding of those fields.
pub fn replace_fields(buf: &[u8], tags: &[u32], replacement: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(buf.len() + replacement.len());
    let mut cur = buf;
    while !cur.is_empty() {
        let field = next_field(&mut cur)?;
        if !tags.contains(&field.tag) {
            out.extend_from_slice(field.raw);
        }
    }
    out.extend_from_slice(replacement);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;
    use crate::xds::envoy::config::core::v3::{DataSource, TypedExtensionConfig, data_source};

    fn field(tag: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_key(tag, WireType::LengthDelimited, &mut out);
        encode_varint(body.len() as u64, &mut out);
        out.extend_from_slice(body);
        out
    }

    // Field 100, varint 1, and field 101, fixed32.
    const UNKNOWN: &[u8] = &[0xa0, 0x06, 0x01, 0xad, 0x06, 1, 2, 3, 4];

    #[test]
    fn nested_rewrite_keeps_unknown_fields() {
        let mut inner = DataSource {
            specifier: Some(data_source::Specifier::Filename("old".to_string())),
        }
        .encode_to_vec();
        inner.extend_from_slice(UNKNOWN);
        let mut outer = TypedExtensionConfig {
            name: "ext".to_string(),
            typed_config: None,
        }
        .encode_to_vec();
        outer.extend(field(2, &inner));
        outer.extend_from_slice(UNKNOWN);

        let replacement = DataSource {
            specifier: Some(data_source::Specifier::Filename("new".to_string())),
        }
        .encode_to_vec();
        let got = rewrite_message(&outer, &[2], &|m| replace_fields(m, &[1], &replacement))
            .unwrap();

        let mut want_inner = UNKNOWN.to_vec();
        want_inner.extend_from_slice(&replacement);
        let mut want = TypedExtensionConfig {
            name: "ext".to_string(),
            typed_config: None,
        }
        .encode_to_vec();
        want.extend(field(2, &want_inner));
        want.extend_from_slice(UNKNOWN);
        assert_eq!(got, want);
    }

    #[test]
    fn missing_path_is_untouched() {
        let msg = field(1, b"name");
        let got = rewrite_message(&msg, &[2, 3], &|_| Ok(b"unused".to_vec())).unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn truncated_input() {
        let mut msg = field(2, b"abcdef");
        msg.truncate(msg.len() - 1);
        assert!(matches!(
            rewrite_message(&msg, &[1], &|m| Ok(m.to_vec())),
            Err(Error::Truncated(2))
        ));
        // A group start is not supported.
        assert!(matches!(
            replace_fields(&[0x0b], &[], &[]),
            Err(Error::Group(1))
        ));
    }
}

//! BER-TLV decoding for EMV, batch and reader-proprietary data

use std::fmt;

use thiserror::Error;

/// Errors raised while decoding a TLV buffer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlvError {
    #[error("malformed TLV at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },

    #[error("invalid hex input: {0}")]
    InvalidHex(String),
}

impl TlvError {
    fn malformed(offset: usize, reason: &'static str) -> Self {
        TlvError::Malformed { offset, reason }
    }
}

/// A decoded data object
///
/// `is_nested` marks a constructed tag (bit `0x20` of the first tag byte). Constructed
/// nodes only appear in the output of [`parse_tree`]; [`parse`] replaces them with their
/// decoded children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    pub tag: Vec<u8>,
    pub length: usize,
    pub value: Vec<u8>,
    pub is_nested: bool,
    pub children: Vec<TlvNode>,
}

impl TlvNode {
    /// Tag as uppercase hex, e.g. `"9F06"`
    pub fn tag_hex(&self) -> String {
        hex::encode_upper(&self.tag)
    }

    /// Value as uppercase hex
    pub fn value_hex(&self) -> String {
        hex::encode_upper(&self.value)
    }

    /// Case-insensitive comparison against a hex tag string
    pub fn has_tag(&self, tag_hex: &str) -> bool {
        self.tag_hex().eq_ignore_ascii_case(tag_hex.trim())
    }
}

impl fmt::Display for TlvNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.tag_hex(), self.length, self.value_hex())
    }
}

/// Tag and declared length of a Data Object List entry (PDOL, CDOL1, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvHeader {
    pub tag: Vec<u8>,
    pub length: usize,
    pub is_nested: bool,
}

impl TlvHeader {
    pub fn tag_hex(&self) -> String {
        hex::encode_upper(&self.tag)
    }
}

/// Outcome of reading one tag: either a real tag or the `00` end marker
enum TagRead {
    Tag { tag: Vec<u8>, constructed: bool },
    End,
}

/// Cursor over a byte buffer; `base` is the absolute offset of `data[0]` for error reporting
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn next_byte(&mut self, reason: &'static str) -> Result<u8, TlvError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| TlvError::malformed(self.offset(), reason))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_tag(&mut self) -> Result<TagRead, TlvError> {
        let first = self.next_byte("missing tag")?;
        let constructed = first & 0x20 == 0x20;
        let mut tag = vec![first];

        if first & 0x1F == 0x1F {
            // Subsequent bytes continue the tag while bit 8 is set
            loop {
                let byte = self.next_byte("truncated multi-byte tag")?;
                tag.push(byte);
                if byte & 0x80 == 0 {
                    break;
                }
            }
        } else if first == 0x00 {
            return Ok(TagRead::End);
        }

        Ok(TagRead::Tag { tag, constructed })
    }

    fn read_length(&mut self) -> Result<usize, TlvError> {
        let start = self.offset();
        let first = self.next_byte("missing length")?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }

        let count = (first & 0x7F) as usize;
        if count == 0 {
            return Err(TlvError::malformed(start, "indefinite length is not supported"));
        }
        if count > std::mem::size_of::<usize>() {
            return Err(TlvError::malformed(start, "length field too wide"));
        }
        if count > self.remaining() {
            return Err(TlvError::malformed(start, "truncated long-form length"));
        }

        let mut length = 0usize;
        for _ in 0..count {
            length = (length << 8) | self.next_byte("truncated long-form length")? as usize;
        }
        Ok(length)
    }

    fn read_value(&mut self, length: usize) -> Result<&'a [u8], TlvError> {
        if length > self.remaining() {
            return Err(TlvError::malformed(
                self.offset(),
                "declared length exceeds remaining buffer",
            ));
        }
        let value = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(value)
    }
}

fn parse_nodes(data: &[u8], base: usize) -> Result<Vec<TlvNode>, TlvError> {
    let mut reader = Reader::new(data, base);
    let mut nodes = Vec::new();

    while reader.remaining() > 0 {
        let (tag, constructed) = match reader.read_tag()? {
            TagRead::Tag { tag, constructed } => (tag, constructed),
            TagRead::End => break,
        };
        let length = reader.read_length()?;
        let value_offset = reader.offset();
        let value = reader.read_value(length)?;

        let children = if constructed {
            parse_nodes(value, value_offset)?
        } else {
            Vec::new()
        };

        nodes.push(TlvNode {
            tag,
            length,
            value: value.to_vec(),
            is_nested: constructed,
            children,
        });
    }

    Ok(nodes)
}

fn flatten_into(nodes: Vec<TlvNode>, out: &mut Vec<TlvNode>) {
    for node in nodes {
        if node.is_nested {
            flatten_into(node.children, out);
        } else {
            out.push(node);
        }
    }
}

/// Parse a TLV buffer into a flat list of primitive data objects
///
/// Children of constructed tags are merged into the output in encounter order and the
/// constructed wrapper itself is dropped. A single-byte `00` tag ends parsing of the
/// current level (trailing padding).
///
/// # Errors
/// [`TlvError::Malformed`] when a tag or length is truncated, or a declared length
/// exceeds the remaining buffer.
pub fn parse(data: &[u8]) -> Result<Vec<TlvNode>, TlvError> {
    let mut flat = Vec::new();
    flatten_into(parse_nodes(data, 0)?, &mut flat);
    Ok(flat)
}

/// Parse a TLV buffer keeping constructed tags as nodes with their children attached
pub fn parse_tree(data: &[u8]) -> Result<Vec<TlvNode>, TlvError> {
    parse_nodes(data, 0)
}

/// Parse a hex-encoded TLV buffer (see [`parse`])
pub fn parse_hex(tlv_hex: &str) -> Result<Vec<TlvNode>, TlvError> {
    parse(&decode_hex(tlv_hex)?)
}

/// Decode a hex string as carried on the reader boundary; whitespace is ignored
pub fn decode_hex(input: &str) -> Result<Vec<u8>, TlvError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| TlvError::InvalidHex(e.to_string()))
}

/// Find the first node with `tag_hex`, depth-first, descending into nested children
pub fn search_tlv<'a>(nodes: &'a [TlvNode], tag_hex: &str) -> Option<&'a TlvNode> {
    for node in nodes {
        if node.has_tag(tag_hex) {
            return Some(node);
        }
        if node.is_nested {
            if let Some(found) = search_tlv(&node.children, tag_hex) {
                return Some(found);
            }
        }
    }
    None
}

/// Parse a Data Object List: a sequence of tag/length headers with no value bytes
pub fn parse_dol(data: &[u8]) -> Result<Vec<TlvHeader>, TlvError> {
    let mut reader = Reader::new(data, 0);
    let mut headers = Vec::new();

    while reader.remaining() > 0 {
        let (tag, constructed) = match reader.read_tag()? {
            TagRead::Tag { tag, constructed } => (tag, constructed),
            TagRead::End => break,
        };
        let length = reader.read_length()?;
        headers.push(TlvHeader {
            tag,
            length,
            is_nested: constructed,
        });
    }

    Ok(headers)
}

/// Heuristic check on the first data object of an EMV configuration buffer
///
/// Buffers led by `9F06` (AID) are TLV. A leading `00`, a constructed first tag, or a
/// first length that overruns the buffer mean the data is not TLV (typically TV).
pub fn is_tlv_format(data: &[u8]) -> bool {
    match data {
        [0x9F, 0x06, ..] => return true,
        [] | [0x00, ..] => return false,
        [first, ..] if first & 0x20 == 0x20 => return false,
        _ => {}
    }

    let mut reader = Reader::new(data, 0);
    let Ok(TagRead::Tag { .. }) = reader.read_tag() else {
        return false;
    };
    if reader.remaining() == 0 {
        return false;
    }
    match reader.read_length() {
        Ok(length) => length <= reader.remaining(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_simple() {
        let data = [0x5A, 0x02, 0x41, 0x11, 0x9F, 0x02, 0x01, 0x05];
        let nodes = parse(&data).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].tag, vec![0x5A]);
        assert_eq!(nodes[0].value, vec![0x41, 0x11]);
        assert_eq!(nodes[1].tag_hex(), "9F02");
        assert_eq!(nodes[1].length, 1);
    }

    #[test]
    fn test_parse_three_byte_tag() {
        let data = [0x9F, 0x81, 0x17, 0x01, 0x01];
        let nodes = parse(&data).unwrap();
        assert_eq!(nodes[0].tag_hex(), "9F8117");
        assert_eq!(nodes[0].value, vec![0x01]);
    }

    #[test]
    fn test_parse_long_form_length() {
        let mut data = vec![0xC2, 0x82, 0x01, 0x04];
        data.extend(std::iter::repeat(0xAB).take(0x104));
        let nodes = parse(&data).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].length, 0x104);
        assert_eq!(nodes[0].value.len(), 0x104);
    }

    #[test]
    fn test_parse_one_byte_long_form() {
        let mut data = vec![0x90, 0x81, 0x80];
        data.extend([0x11; 0x80]);
        data.extend([0x8F, 0x01, 0x05]);
        let nodes = parse(&data).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].length, 0x80);
        assert_eq!(nodes[1].value, vec![0x05]);
    }

    #[test]
    fn test_nested_children_are_flattened_and_wrapper_dropped() {
        // 70 { 5A 01 11, 5F20 02 4142 } 9F02 01 99
        let data = [
            0x70, 0x08, 0x5A, 0x01, 0x11, 0x5F, 0x20, 0x02, 0x41, 0x42, 0x9F, 0x02, 0x01,
            0x99,
        ];
        let nodes = parse(&data).unwrap();
        let tags: Vec<String> = nodes.iter().map(TlvNode::tag_hex).collect();
        assert_eq!(tags, vec!["5A", "5F20", "9F02"]);
        assert!(nodes.iter().all(|n| !n.is_nested));
    }

    #[test]
    fn test_parse_tree_keeps_wrapper() {
        let data = [0x70, 0x03, 0x5A, 0x01, 0x11];
        let nodes = parse_tree(&data).unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_nested);
        assert_eq!(nodes[0].children[0].tag_hex(), "5A");

        let found = search_tlv(&nodes, "5a").unwrap();
        assert_eq!(found.value, vec![0x11]);
    }

    #[test]
    fn test_zero_tag_terminates() {
        let data = [0x5A, 0x01, 0x11, 0x00, 0xFF, 0xFF, 0xFF];
        let nodes = parse(&data).unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn test_declared_length_overrun_is_malformed() {
        let data = [0x5A, 0x05, 0x11, 0x22];
        let err = parse(&data).unwrap_err();
        assert!(matches!(err, TlvError::Malformed { offset: 2, .. }));
    }

    #[test]
    fn test_truncated_length_is_malformed() {
        assert!(parse(&[0x9F, 0x02]).is_err());
        assert!(parse(&[0x9F]).is_err());
        assert!(parse(&[0x5A, 0x82, 0x01]).is_err());
    }

    #[test]
    fn test_nested_error_reports_absolute_offset() {
        let data = [0x5A, 0x01, 0x11, 0x70, 0x03, 0x5A, 0x09, 0x11];
        let err = parse(&data).unwrap_err();
        assert_eq!(
            err,
            TlvError::Malformed {
                offset: 7,
                reason: "declared length exceeds remaining buffer"
            }
        );
    }

    #[test]
    fn test_parse_hex_and_search_case_insensitive() {
        assert!(parse_hex("5A0").is_err());

        let nodes = parse_hex("9F0607A0000003330101C408621067FFFF0474F0").unwrap();
        assert_eq!(search_tlv(&nodes, "9f06").unwrap().value_hex(), "A0000003330101");
        assert_eq!(search_tlv(&nodes, "C4").unwrap().value_hex(), "621067FFFF0474F0");
        assert!(search_tlv(&nodes, "5A").is_none());
    }

    #[test]
    fn test_parse_hex_rejects_garbage() {
        assert!(matches!(parse_hex("5A0G"), Err(TlvError::InvalidHex(_))));
    }

    #[test]
    fn test_parse_dol() {
        // 9F02 06, 9F03 06, 9F1A 02, 95 05
        let data = [0x9F, 0x02, 0x06, 0x9F, 0x03, 0x06, 0x9F, 0x1A, 0x02, 0x95, 0x05];
        let headers = parse_dol(&data).unwrap();
        let summary: Vec<(String, usize)> =
            headers.iter().map(|h| (h.tag_hex(), h.length)).collect();
        assert_eq!(
            summary,
            vec![
                ("9F02".to_string(), 6),
                ("9F03".to_string(), 6),
                ("9F1A".to_string(), 2),
                ("95".to_string(), 5)
            ]
        );
    }

    #[test]
    fn test_is_tlv_format() {
        assert!(is_tlv_format(&[0x9F, 0x06, 0x07]));
        assert!(!is_tlv_format(&[0x00, 0x01]));
        assert!(!is_tlv_format(&[0x70, 0x01, 0x00]));
        assert!(is_tlv_format(&[0x5F, 0x2A, 0x02, 0x01, 0x56]));
        assert!(!is_tlv_format(&[0x5F, 0x2A, 0x05, 0x01]));
        assert!(!is_tlv_format(&[0x5F, 0x2A]));
        assert!(!is_tlv_format(&[]));
    }

    fn primitive_tag() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            // single byte, primitive, not 0x00 and not a multi-byte lead
            (1u8..=0xFF)
                .prop_filter("primitive single-byte", |b| b & 0x20 == 0 && b & 0x1F != 0x1F)
                .prop_map(|b| vec![b]),
            (0u8..0x80).prop_map(|b| vec![0x9F, b]),
        ]
    }

    proptest! {
        #[test]
        fn prop_short_form_pairs_decode_in_order(
            pairs in prop::collection::vec(
                (primitive_tag(), prop::collection::vec(any::<u8>(), 0..=0x7F)),
                0..12,
            )
        ) {
            let mut buffer = Vec::new();
            for (tag, value) in &pairs {
                buffer.extend(tag);
                buffer.push(value.len() as u8);
                buffer.extend(value);
            }

            let nodes = parse(&buffer).unwrap();
            prop_assert_eq!(nodes.len(), pairs.len());

            let mut consumed = 0;
            for (node, (tag, value)) in nodes.iter().zip(&pairs) {
                prop_assert_eq!(&node.tag, tag);
                prop_assert_eq!(&node.value, value);
                consumed += node.tag.len() + 1 + node.length;
            }
            prop_assert_eq!(consumed, buffer.len());
        }
    }
}

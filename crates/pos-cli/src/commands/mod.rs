pub mod brand;
pub mod pin_block;
pub mod simulate;
pub mod tlv;

use pos_common::{get_tag_name, TlvNode};

use crate::formatters::{self, FormatMode};

/// Display decoded TLV nodes, one per line, children indented under their template
pub(crate) fn display_nodes(nodes: &[TlvNode], mode: FormatMode, indent: usize) {
    let pad = "  ".repeat(indent);
    for node in nodes {
        if node.is_nested {
            println!(
                "{}[{}] {} ({} bytes)",
                pad,
                node.tag_hex(),
                get_tag_name(&node.tag),
                node.length
            );
            display_nodes(&node.children, mode, indent + 1);
        } else {
            println!(
                "{}[{}] {}: {}",
                pad,
                node.tag_hex(),
                get_tag_name(&node.tag),
                formatters::format_value(&node.tag, &node.value, mode)
            );
        }
    }
}

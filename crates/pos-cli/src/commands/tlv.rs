//! Decode BER-TLV buffers and Data Object Lists

use pos_common::{decode_hex, get_tag_name, is_tlv_format, parse_dol, parse_tree, search_tlv};

use super::display_nodes;
use crate::formatters::{self, FormatMode};

pub fn cmd_tlv(input: &str, search: Option<&str>, mode: FormatMode) {
    let bytes = match decode_hex(input) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Invalid input: {}", err);
            return;
        }
    };

    let nodes = match parse_tree(&bytes) {
        Ok(nodes) => nodes,
        Err(err) => {
            eprintln!("Failed to decode TLV: {}", err);
            return;
        }
    };

    if let Some(tag) = search {
        match search_tlv(&nodes, tag) {
            Some(node) => println!(
                "[{}] {}: {}",
                node.tag_hex(),
                get_tag_name(&node.tag),
                formatters::format_value(&node.tag, &node.value, mode)
            ),
            None => eprintln!("Tag {} not found", tag.to_uppercase()),
        }
        return;
    }

    println!("TLV Decode - {} Mode\n", mode.description());
    if !is_tlv_format(&bytes) {
        println!("(first object does not look like TLV; the buffer may be tag-value only)\n");
    }
    println!("{} bytes, {} top-level object(s):\n", bytes.len(), nodes.len());
    display_nodes(&nodes, mode, 1);
}

pub fn cmd_dol(input: &str) {
    let bytes = match decode_hex(input) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Invalid input: {}", err);
            return;
        }
    };

    let entries = match parse_dol(&bytes) {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("Failed to decode DOL: {}", err);
            return;
        }
    };

    println!("Data Object List - {} entries\n", entries.len());
    let mut total = 0;
    for entry in &entries {
        println!(
            "  [{}] {}: {} bytes",
            entry.tag_hex(),
            get_tag_name(&entry.tag),
            entry.length
        );
        total += entry.length;
    }
    println!("\nTotal data length: {} bytes", total);
}

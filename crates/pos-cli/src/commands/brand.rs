use pos_bin::{detect_card_type, is_valid_card, is_valid_luhn};

pub fn cmd_brand(pan: &str) {
    let digits: String = pan.chars().filter(|c| !c.is_whitespace()).collect();
    let brand = detect_card_type(&digits);

    println!("PAN:             {}", digits);
    println!("Brand:           {}", brand);
    println!(
        "Length:          {} (expected {})",
        digits.len(),
        brand.expected_length()
    );
    println!(
        "Luhn checksum:   {}",
        if is_valid_luhn(&digits) { "✓" } else { "✗" }
    );
    println!(
        "Valid card:      {}",
        if is_valid_card(&digits) { "✓" } else { "✗" }
    );
}

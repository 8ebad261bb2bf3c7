use pos_terminal::crypto::{generate_random_data, BLOCK_SIZE};
use pos_terminal::{build_pin_block, PinBlockContext};

pub fn cmd_pin_block(pan: &str, key: &str, pin: &str, random: Option<&str>) {
    let random_data = match random {
        Some(random) => random.to_string(),
        None => generate_random_data(BLOCK_SIZE),
    };

    let context = PinBlockContext {
        pan: pan.to_string(),
        aes_key: key.to_string(),
        random_data,
        pin_try_limit: None,
        is_online_pin: true,
    };

    match build_pin_block(&context, pin) {
        Ok(block) => {
            println!("Random data: {}", context.random_data);
            println!("PIN block:   {}", block);
        }
        Err(err) => eprintln!("Failed to build PIN block: {}", err),
    }
}

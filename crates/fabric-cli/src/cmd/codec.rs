//! Offline frame encoding and inspection.

use crate::ui;
use fabric_wire::{Message, MessageType};

pub fn cmd_encode(kind: &str, payload: &str) {
    if MessageType::from_name(kind).is_none() {
        ui::warn_with_fix(
            &format!("Unknown message type '{kind}', encoding as Generic"),
            &format!("Known types: {}", known_type_names()),
        );
    }
    match Message::from_vector(kind, payload.to_string()) {
        Ok(message) => {
            println!("{}", hex::encode(message.to_raw()));
            ui::kv("Id", &message.id().to_hex());
        }
        Err(e) => {
            ui::error(&format!("Cannot encode message: {e}"));
            std::process::exit(1);
        }
    }
}

pub fn cmd_decode(input: &str, unverified: bool) {
    let raw = match hex::decode(input.trim()) {
        Ok(raw) => raw,
        Err(e) => {
            ui::error_with_fix(
                &format!("Input is not valid hex: {e}"),
                "Pass the frame bytes as one hex string",
            );
            std::process::exit(1);
        }
    };

    let decoded = if unverified {
        Message::from_raw_unverified(&raw)
    } else {
        Message::from_raw(&raw)
    };
    let message = match decoded {
        Ok(message) => message,
        Err(e) => {
            ui::error_with_fix(
                &format!("Cannot decode frame: {e}"),
                "Use --unverified to skip the payload hash check",
            );
            std::process::exit(1);
        }
    };

    ui::section("Frame");
    ui::kv("Type", &format!("{} (0x{:X})", message.kind(), message.code()));
    ui::kv("Version", &message.version().to_string());
    ui::kv("Size", &message.size().to_string());
    ui::kv("Hash", &hex::encode(message.hash()));
    ui::kv("Id", &message.id().to_hex());
    if message.verify_hash() {
        ui::kv_ok("Integrity", "hash matches payload");
    } else {
        ui::kv_warn("Integrity", "hash does not match payload");
    }
    if raw.len() > message.header().frame_len() {
        ui::kv_warn(
            "Trailing",
            &format!("{} bytes ignored", raw.len() - message.header().frame_len()),
        );
    }
    ui::blank();
    match message.payload_str() {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{}", hex::encode(message.payload())),
    }
}

fn known_type_names() -> String {
    MessageType::KNOWN
        .iter()
        .map(|t| t.name())
        .collect::<Vec<_>>()
        .join(", ")
}

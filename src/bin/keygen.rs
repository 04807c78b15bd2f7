//! Ed25519 payer keypair generator for apicover.
//!
//! Generates a payer keypair and outputs:
//! - Public key (hex) to use as the `payer` field of authorizations
//! - Secret key saved to a file (for signing payment authorizations)
//!
//! Usage:
//!   cargo run --bin apicover-keygen [output-dir]

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    println!("Ed25519 payer keypair generator for apicover\n");

    // Get output directory from args or use current directory
    let args: Vec<String> = env::args().collect();
    let output_dir = if args.len() > 1 {
        Path::new(&args[1]).to_path_buf()
    } else {
        env::current_dir().expect("Failed to get current directory")
    };

    fs::create_dir_all(&output_dir).expect("Failed to create output directory");

    println!("Generating ed25519 keypair...");
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_hex = hex::encode(signing_key.verifying_key().to_bytes());
    let secret_hex = hex::encode(signing_key.to_bytes());

    // Save secret key to file (KEEP THIS SECURE!)
    let sk_path = output_dir.join("payer-key.secret");
    fs::write(&sk_path, &secret_hex).expect("Failed to write secret key");
    println!("\nSecret key saved to: {}", sk_path.display());
    println!("  WARNING: Keep this file secure! It signs payment authorizations.");

    // Save public key to file
    let pk_path = output_dir.join("payer-key.pub");
    fs::write(&pk_path, &public_hex).expect("Failed to write public key");
    println!("Public key saved to: {}", pk_path.display());

    println!("\nPayer identity (use as the `payer` field):");
    println!("  {public_hex}");
}

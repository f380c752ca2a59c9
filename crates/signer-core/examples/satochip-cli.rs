//! Satochip CLI Example
//!
//! This example demonstrates how to use the hardware signer library with a
//! Satochip card on a PC/SC reader (contact or NFC) on macOS, Linux, and
//! Windows.
//!
//! # Prerequisites
//!
//! - A Satochip card and a PC/SC reader (ACR122U and similar NFC readers work)
//! - PC/SC daemon running (built-in on macOS/Windows, `pcscd` on Linux)
//!
//! # Quick Start
//!
//! ```bash
//! cargo run --example satochip-cli -p hw-signer-core --features pcsc -- list
//! cargo run --example satochip-cli -p hw-signer-core --features pcsc -- info
//! RUST_LOG=hw_signer_core=debug \
//!   cargo run --example satochip-cli -p hw-signer-core --features pcsc -- details 0 multisig
//! ```
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `list` | List available PC/SC readers |
//! | `info` | Show setup state and authenticity |
//! | `setup` | Set the PIN of a fresh card |
//! | `details [account] [multisig]` | Show account xpubs and fingerprint |
//! | `sign <hash> [sub-path]` | Sign a 32-byte hash with `m/84'/0'/0'/<sub-path>` |
//!
//! Set `SATOCHIP_READER` to pick a reader by name and `SATOCHIP_TESTNET=1`
//! for testnet paths and `tpub` keys.
//!
//! # Security Notes
//!
//! - Private keys never leave the card
//! - A wrong PIN decrements the card's retry counter; the CLI never retries

#![expect(unused_crate_dependencies, reason = "needed for CLI example")]

use std::env;
use std::io::{self, Write};
use std::time::Duration;

use hw_signer_core::card::{PcscTransport, SatochipCard};
use hw_signer_core::manage::{get_card_details, get_card_info, setup_card};
use hw_signer_core::sign::sign_with_card;
use hw_signer_core::{Error, Network, SignatureRequest, SignatureRequestBatch, SignerConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return;
    }

    let result = match args[1].as_str() {
        "list" => cmd_list(),
        "info" => cmd_info(),
        "setup" => cmd_setup(),
        "details" => cmd_details(&args[2..]),
        "sign" => cmd_sign(&args[2..]),
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_help();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e.user_message());
    }
}

fn print_help() {
    println!(
        r#"Satochip CLI

USAGE:
    satochip-cli <COMMAND>

COMMANDS:
    list                          List available PC/SC readers
    info                          Show setup state and card authenticity
    setup                         Set the PIN of a fresh card
    details [account] [multisig]  Show account xpubs and master fingerprint (requires PIN)
    sign <hex> [sub-path]         Sign a 32-byte hash (requires PIN)
    help                          Show this help message

ENVIRONMENT:
    SATOCHIP_READER    Substring of the reader name to use
    SATOCHIP_TESTNET   Set to 1 for testnet
    RUST_LOG           Log filter, e.g. hw_signer_core=debug

EXAMPLES:
    cargo run --example satochip-cli --features pcsc -- list
    cargo run --example satochip-cli --features pcsc -- details 0 multisig
    cargo run --example satochip-cli --features pcsc -- sign 0x$(printf '00%.0s' {{1..32}}) 0/0
"#
    );
}

fn config() -> SignerConfig {
    let network = if env::var("SATOCHIP_TESTNET").is_ok_and(|v| v == "1") {
        Network::Testnet
    } else {
        Network::Mainnet
    };
    SignerConfig::for_network(network).with_connect_timeout(Duration::from_secs(30))
}

fn card() -> Result<SatochipCard<PcscTransport>, Error> {
    let reader = env::var("SATOCHIP_READER").ok();
    println!("Present the card to the reader...");
    Ok(SatochipCard::new(PcscTransport::connect(reader.as_deref())?))
}

fn cmd_list() -> Result<(), Error> {
    println!("Searching for PC/SC readers...\n");

    let readers = PcscTransport::list_readers()?;
    if readers.is_empty() {
        println!("No readers found.");
        println!("\nMake sure:");
        println!("  - Your reader is plugged in");
        println!("  - The PC/SC daemon is running");
        println!("    - macOS: launchctl list | grep pcscd");
        println!("    - Linux: systemctl status pcscd");
    } else {
        println!("Found {} reader(s):\n", readers.len());
        for (i, reader) in readers.iter().enumerate() {
            println!("  [{}] {}", i + 1, reader);
        }
    }
    Ok(())
}

fn cmd_info() -> Result<(), Error> {
    let info = get_card_info(card()?, &config(), None)?;

    println!();
    println!("Setup done:    {}", info.setup_done);
    println!("Seeded:        {}", info.is_seeded);
    println!("Authentic:     {}", info.is_authentic);
    println!("               {}", info.authenticity_msg);
    Ok(())
}

fn cmd_setup() -> Result<(), Error> {
    println!("Setting the PIN of a fresh card.\n");
    let pin = prompt_pin()?;
    let confirm = prompt_pin()?;
    if pin != confirm {
        eprintln!("PINs do not match.");
        return Ok(());
    }

    setup_card(card()?, &config(), &pin)?;
    println!("Card set up. Import a seed before deriving keys.");
    Ok(())
}

fn cmd_details(args: &[String]) -> Result<(), Error> {
    let account = match args.first().map(|a| a.parse::<u32>()) {
        Some(Ok(account)) => account,
        Some(Err(e)) => {
            eprintln!("Invalid account: {e}");
            return Ok(());
        }
        None => 0,
    };
    let multisig = args.get(1).is_some_and(|a| a == "multisig");

    let pin = prompt_pin()?;
    let details = get_card_details(card()?, &config(), &pin, account, multisig)?;

    println!();
    println!("Master Fingerprint: {}", details.master_fingerprint);
    println!("Derivation Path:    {}", details.derivation_path);
    println!("Xpub:               {}", details.xpub);
    println!();
    println!("P2WPKH: {}", details.xpub_details.p2wpkh.derivation_path);
    println!("  {}", details.xpub_details.p2wpkh.xpub);
    println!("P2WSH:  {}", details.xpub_details.p2wsh.derivation_path);
    println!("  {}", details.xpub_details.p2wsh.xpub);
    Ok(())
}

fn cmd_sign(args: &[String]) -> Result<(), Error> {
    let Some(hash_arg) = args.first() else {
        eprintln!("Usage: sign <32-byte-hash-hex> [sub-path]");
        eprintln!(
            "Example: sign 0x0000000000000000000000000000000000000000000000000000000000000001 0/0"
        );
        return Ok(());
    };

    let hash_hex = hash_arg.strip_prefix("0x").unwrap_or(hash_arg);
    let Ok(digest) = <[u8; 32]>::try_from(hex::decode(hash_hex)?) else {
        eprintln!("Hash must be exactly 32 bytes");
        return Ok(());
    };
    let sub_path = args.get(1).map_or("0/0", String::as_str);

    let config = config();
    let base_path = format!("m/84'/{}'/0'", config.network.coin_type());

    println!("Signing hash: 0x{}\n", hex::encode(digest));
    let pin = prompt_pin()?;

    let batch = SignatureRequestBatch(vec![SignatureRequest {
        digest,
        sub_path: sub_path.to_string(),
        input_index: 0,
        sighash_type: 1,
        public_key: String::new(),
        signature: None,
    }]);
    let signed = sign_with_card(card()?, &config, None, &batch, &pin, &base_path)?;

    for request in signed.requests() {
        if let Some(signature) = request.signature {
            println!();
            println!("Signature (r || s, low-S):");
            println!("  r: 0x{}", hex::encode(signature.r()));
            println!("  s: 0x{}", hex::encode(signature.s()));
            println!();
            println!("Compact (64 bytes):");
            println!("  {signature}");
        }
    }
    Ok(())
}

fn prompt_pin() -> Result<String, Error> {
    print!("Enter PIN: ");
    io::stdout()
        .flush()
        .map_err(|e| Error::Transport(e.to_string()))?;

    let mut pin = String::new();
    io::stdin()
        .read_line(&mut pin)
        .map_err(|e| Error::Transport(e.to_string()))?;
    Ok(pin.trim().to_string())
}

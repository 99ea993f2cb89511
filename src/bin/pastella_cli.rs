// pastella-cli — command line client for a running pastellad.
//
// Thin HTTP/1.1 client over a raw TcpStream: no daemon state lives here.
// Wallet-local verbs (createwallet, send) read the wallet file directly and
// only touch the node through the public API.

use std::env;

use colored::*;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use pastella::config::{DEFAULT_API_PORT, default_data_dir};
use pastella::consensus::utxo::{OutPoint, Utxo, UtxoSet};
use pastella::now_ms;
use pastella::wallet::Wallet;

fn print_usage() {
    println!("{}", "pastella-cli — node control".bright_yellow().bold());
    println!();
    println!("  Usage: pastella-cli <command> [args...]");
    println!();
    println!("{}", "  Commands:".bright_white().bold());
    let rows: &[(&str, &str)] = &[
        ("status", "Chain status (height, work, difficulty)"),
        ("latest", "Show the tip block"),
        ("block <index>", "Show a block by height"),
        ("tx <id>", "Look up a transaction"),
        ("balance <address>", "UTXO balance of an address"),
        ("mempool", "Pending transactions"),
        ("send <to> <amount> [fee]", "Sign and submit a spend from the local wallet"),
        ("createwallet", "Create (or show) the local wallet"),
        ("peers", "Connected peers"),
        ("reputation", "Peer reputation table"),
        ("partition", "Partition detector stats"),
        ("info", "Node version and network info"),
        ("connect <host:port>", "Ask the node to dial a peer"),
        ("stop", "Stop the daemon"),
    ];
    for (cmd, help) in rows {
        println!("  {} {:<28} {}", "❯".bright_black(), cmd.bright_green(), help.white());
    }
    println!();
    println!(
        "  Environment: PASTELLA_API_PORT (default {DEFAULT_API_PORT}), PASTELLA_API_KEY, PASTELLA_DATA_DIR"
    );
}

fn api_port() -> u16 {
    env::var("PASTELLA_API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_API_PORT)
}

fn data_dir() -> std::path::PathBuf {
    env::var("PASTELLA_DATA_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_data_dir())
}

async fn http_request(method: &str, path: &str, body: Option<&Value>) -> Result<Value, String> {
    let addr = format!("127.0.0.1:{}", api_port());
    let mut stream = TcpStream::connect(&addr).await.map_err(|_| {
        format!("cannot connect to pastellad at {addr} — is the daemon running?")
    })?;

    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let api_key_header = env::var("PASTELLA_API_KEY")
        .map(|k| format!("X-API-Key: {k}\r\n"))
        .unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\n{api_key_header}Content-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len(),
    );

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(|e| e.to_string())?;

    let text = String::from_utf8_lossy(&response);
    let body_start = text.find("\r\n\r\n").ok_or("malformed HTTP response")?;
    serde_json::from_str(&text[body_start + 4..]).map_err(|e| format!("bad response body: {e}"))
}

fn print_result(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(pretty) => println!("{}", pretty.bright_white()),
        Err(_) => println!("{value}"),
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{} {message}", "error:".bright_red().bold());
    std::process::exit(1);
}

async fn send_command(to: &str, amount: u64, fee: Option<u64>) -> Result<Value, String> {
    let wallet_path = data_dir().join("wallet.json");
    if !wallet_path.exists() {
        return Err("no wallet file — run `pastella-cli createwallet` first".to_string());
    }
    let wallet = Wallet::load_or_create(&wallet_path, now_ms()).map_err(|e| e.to_string())?;

    let info = http_request("GET", "/api/info", None).await?;
    let fee = fee.unwrap_or_else(|| {
        // Default fee comes from the node config when not given.
        info.get("defaultFee").and_then(|f| f.as_u64()).unwrap_or(10_000)
    });

    let utxo_resp = http_request(
        "GET",
        &format!("/api/blockchain/address/{}/utxos", wallet.address()),
        None,
    )
    .await?;
    let mut utxos = UtxoSet::new();
    for entry in utxo_resp
        .get("utxos")
        .and_then(|u| u.as_array())
        .cloned()
        .unwrap_or_default()
    {
        let (Some(tx_id), Some(index), Some(amount)) = (
            entry.get("txId").and_then(|v| v.as_str()),
            entry.get("outputIndex").and_then(|v| v.as_u64()),
            entry.get("amount").and_then(|v| v.as_u64()),
        ) else {
            continue;
        };
        utxos.insert(
            OutPoint::new(tx_id, index as u32),
            Utxo {
                address: wallet.address(),
                amount,
                height_created: entry
                    .get("heightCreated")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            },
        );
    }

    let tx = wallet
        .build_transaction(&utxos, to, amount, fee, now_ms())
        .map_err(|e| e.to_string())?;
    http_request(
        "POST",
        "/api/blockchain/transactions",
        Some(&json!({ "transaction": tx })),
    )
    .await
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        print_usage();
        return;
    };

    // Wallet-local verbs first; everything else talks to the daemon.
    if command == "createwallet" {
        let path = data_dir().join("wallet.json");
        match Wallet::load_or_create(&path, now_ms()) {
            Ok(wallet) => {
                println!("{}", "PASTELLA WALLET".bright_green().bold());
                println!("{} {}", "Address:".bright_yellow(), wallet.address().bright_white());
                println!("{} {}", "File:   ".bright_yellow(), path.display());
                println!();
                println!(
                    "{}",
                    "Keep the wallet file safe — it holds the spending key.".red()
                );
            }
            Err(e) => fail(e),
        }
        return;
    }

    let result = match (command, args.get(1), args.get(2), args.get(3)) {
        ("status", ..) => http_request("GET", "/api/blockchain/status", None).await,
        ("latest", ..) => http_request("GET", "/api/blockchain/latest", None).await,
        ("block", Some(index), ..) => {
            http_request("GET", &format!("/api/blockchain/blocks/{index}"), None).await
        }
        ("tx", Some(id), ..) => {
            http_request("GET", &format!("/api/blockchain/transactions/{id}"), None).await
        }
        ("balance", Some(address), ..) => {
            http_request(
                "GET",
                &format!("/api/blockchain/address/{address}/balance"),
                None,
            )
            .await
        }
        ("mempool", ..) => http_request("GET", "/api/blockchain/transactions", None).await,
        ("send", Some(to), Some(amount), fee) => {
            let amount: u64 = match amount.parse() {
                Ok(v) => v,
                Err(_) => fail("amount must be a whole number of atomic units"),
            };
            let fee: Option<u64> = match fee.map(|f| f.parse()) {
                Some(Ok(v)) => Some(v),
                Some(Err(_)) => fail("fee must be a whole number of atomic units"),
                None => None,
            };
            send_command(to, amount, fee).await
        }
        ("peers", ..) => http_request("GET", "/api/network/peers", None).await,
        ("reputation", ..) => http_request("GET", "/api/network/reputation", None).await,
        ("partition", ..) => http_request("GET", "/api/network/partition-stats", None).await,
        ("info", ..) => http_request("GET", "/api/info", None).await,
        ("connect", Some(peer), ..) => {
            http_request(
                "POST",
                "/api/network/connect",
                Some(&json!({ "peer": peer })),
            )
            .await
        }
        ("stop", ..) => http_request("POST", "/api/daemon/stop", None).await,
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    match result {
        Ok(value) => {
            if let Some(error) = value.get("error") {
                eprintln!(
                    "{} {error} {}",
                    "Error:".bright_red().bold(),
                    value.get("detail").map(|d| d.to_string()).unwrap_or_default()
                );
                std::process::exit(1);
            }
            print_result(&value);
        }
        Err(e) => fail(e),
    }
}

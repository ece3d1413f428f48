use std::error::Error;
use std::path::Path;
use std::time::Duration;

use indicatif::ProgressBar;
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::client::{ChatClient, ClientEvent, Payload};
use crate::protocol::PacketType;

/// Run the interactive console client.
///
/// Connects to the relay, waits for the key exchange, then reads commands
/// from stdin while a background task prints incoming events:
/// - `/send <message>` (or any bare input) sends a text message
/// - `/file <path>` and `/photo <path>` upload a file
/// - `/download <fileId>` fetches a stored file
/// - `/quit` disconnects
pub async fn run(addr: &str) -> Result<(), Box<dyn Error>> {
    debug!("connecting to relay at {}", addr);

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Exchanging keys");

    let (client, mut events) = ChatClient::connect(addr).await?;

    // Incoming traffic is printed as it arrives, independent of stdin.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(event).await;
        }
    });

    client.wait_until_ready().await?;
    spinner.finish_with_message("Ready");

    println!("Commands:");
    println!("  /send <message>    - Send text message");
    println!("  /file <path>       - Send file");
    println!("  /photo <path>      - Send photo");
    println!("  /download <fileId> - Download file");
    println!("  /quit              - Exit");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if input == "/quit" {
            client.disconnect().await;
            break;
        }

        let result = if let Some(message) = input.strip_prefix("/send ") {
            client.send_text(message).await
        } else if let Some(path) = input.strip_prefix("/file ") {
            send_file(&client, path, PacketType::File).await
        } else if let Some(path) = input.strip_prefix("/photo ") {
            send_file(&client, path, PacketType::Photo).await
        } else if let Some(file_id) = input.strip_prefix("/download ") {
            println!("Requesting download for file: {}", file_id);
            client.request_download(file_id).await
        } else if input.starts_with('/') {
            println!("Unknown command. Type /quit to exit.");
            Ok(())
        } else {
            client.send_text(input).await
        };

        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }

    Ok(())
}

async fn send_file(
    client: &ChatClient,
    path: &str,
    kind: PacketType,
) -> Result<(), crate::error::ChatError> {
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Sending {}", path));

    let message_id = client.send_file_from_path(Path::new(path), kind).await?;

    spinner.finish_with_message(format!("Sent ({})", message_id));
    Ok(())
}

async fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::ConnectionStatusChanged { connected, detail } => {
            println!("[status] {} ({})", detail, if connected { "online" } else { "offline" });
        }
        ClientEvent::KeyExchangeCompleted => {
            println!("Key exchange completed. You can now send messages.");
        }
        ClientEvent::MessageReceived { packet, payload, own } => match payload {
            Payload::Text(text) => {
                let sender = packet.sender_id.as_deref().unwrap_or("unknown");
                if own {
                    println!("[You]: {}", text);
                } else if let Some(file_name) = packet.file_name.as_deref() {
                    // Availability notice: point at the download id.
                    println!(
                        "[{}] {} ({} bytes). Use '/download {}' to fetch it.",
                        sender,
                        file_name,
                        packet.file_size.unwrap_or(0),
                        packet.message_id
                    );
                } else {
                    println!("[{}]: {}", sender, text);
                }
            }
            Payload::Binary(data) => {
                if own {
                    println!(
                        "[You] sent {} ({} bytes)",
                        packet.file_name.as_deref().unwrap_or("file"),
                        data.len()
                    );
                    return;
                }
                let output = format!("downloaded_{}", packet.message_id);
                match tokio::fs::write(&output, &data).await {
                    Ok(()) => println!("File downloaded: {} ({} bytes)", output, data.len()),
                    Err(e) => println!("Could not save {}: {}", output, e),
                }
            }
        },
    }
}

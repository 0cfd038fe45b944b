//! Minimal in-process MQTT endpoint for tests
//!
//! Speaks just enough MQTT 3.1.1 to accept a connection, acknowledge
//! subscriptions, answer pings, and replay a scripted list of publishes
//! after each SUBACK. QoS 0 only, nothing retained.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Bind an ephemeral port, serve connections in the background, return the
/// port. `publishes` (topic, payload) are sent after every SUBACK.
pub(crate) async fn spawn(publishes: Vec<(String, Vec<u8>)>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let script = publishes.clone();
            tokio::spawn(async move {
                let _ = serve_session(socket, script).await;
            });
        }
    });
    port
}

async fn serve_session(
    mut socket: TcpStream,
    publishes: Vec<(String, Vec<u8>)>,
) -> Option<()> {
    loop {
        let (packet_type, body) = read_packet(&mut socket).await?;
        match packet_type {
            // CONNECT -> CONNACK, session not present, accepted
            1 => socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.ok()?,
            // SUBSCRIBE -> SUBACK (echo packet id, grant QoS 0), then replay
            8 => {
                let suback = [0x90, 0x03, *body.first()?, *body.get(1)?, 0x00];
                socket.write_all(&suback).await.ok()?;
                for (topic, payload) in &publishes {
                    socket.write_all(&encode_publish(topic, payload)).await.ok()?;
                }
            }
            // PINGREQ -> PINGRESP
            12 => socket.write_all(&[0xD0, 0x00]).await.ok()?,
            // DISCONNECT
            14 => return Some(()),
            _ => {}
        }
    }
}

async fn read_packet(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let first = socket.read_u8().await.ok()?;
    let mut remaining = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = socket.read_u8().await.ok()?;
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; remaining];
    socket.read_exact(&mut body).await.ok()?;
    Some((first >> 4, body))
}

fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![0x30];
    let mut remaining = body.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if remaining == 0 {
            break;
        }
    }
    packet.extend_from_slice(&body);
    packet
}

//! Scripted stand-in for the OpenVPN side of the management socket.

#![allow(dead_code)]

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakeServer {
    listener: TcpListener,
    pub port: u16,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub async fn accept(&self) -> FakePeer {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        let (reader, writer) = stream.into_split();
        FakePeer {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }
}

pub struct FakePeer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakePeer {
    /// Send one CRLF-terminated line
    pub async fn send(&mut self, line: &str) {
        self.send_raw(&format!("{}\r\n", line)).await;
    }

    /// Send bytes exactly as given
    pub async fn send_raw(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next command from the client, skipping NUL flush padding.
    /// `None` once the client closed the socket.
    pub async fn next_command(&mut self) -> Option<String> {
        loop {
            let line = tokio::time::timeout(STEP_TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for a command")
                .ok()??;
            if !line.is_empty() && line.chars().all(|c| c == '\0') {
                continue;
            }
            return Some(line);
        }
    }

    /// Read commands until `expected` arrives; returns everything read,
    /// `expected` included.
    pub async fn expect_command(&mut self, expected: &str) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            match self.next_command().await {
                Some(line) => {
                    let done = line == expected;
                    seen.push(line);
                    if done {
                        return seen;
                    }
                }
                None => panic!("connection closed before '{}', saw {:?}", expected, seen),
            }
        }
    }

    /// Wait until the client closes the socket
    pub async fn expect_closed(&mut self) {
        while self.next_command().await.is_some() {}
    }
}

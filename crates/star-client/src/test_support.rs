//! In-memory scriptable client/server pair for tests, mirroring the shape
//! of the teacher's `rt-test-utils` mock harness: instead of binding a real
//! TCP port, this hands out a connected [`WebSocketStream`] pair over a
//! `tokio::io::duplex` channel so tests can drive both ends without a
//! socket.

use star_protocol::Envelope;
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// Builds a connected pair of in-memory WebSocket streams: the "client"
/// side initiates the handshake, the "server" side accepts it. Both ends
/// are plain `WebSocketStream<DuplexStream>` and can be driven with
/// `BaseClient::from_stream` or plugged directly into a router test.
pub async fn duplex_pair(buffer: usize) -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(buffer);

    let server_fut = tokio_tungstenite::accept_async(server_io);
    let client_fut = tokio_tungstenite::client_async("ws://test.local/", client_io);

    let (server_result, client_result) = tokio::join!(server_fut, client_fut);
    let server = server_result.expect("in-memory server handshake failed");
    let (client, _response) = client_result.expect("in-memory client handshake failed");

    (client, server)
}

/// A minimal scripted peer for driving one side of a [`duplex_pair`]
/// directly in a test: send/receive raw envelopes without going through
/// `BaseClient`'s dispatcher.
pub struct ScriptedPeer {
    stream: WebSocketStream<DuplexStream>,
}

impl ScriptedPeer {
    pub fn new(stream: WebSocketStream<DuplexStream>) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        use futures_util::SinkExt;
        let encoded = envelope.encode().expect("encode envelope");
        self.stream
            .send(WsMessage::Text(encoded.into()))
            .await
            .expect("send over in-memory duplex");
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        use futures_util::StreamExt;
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Envelope::decode(&text).ok(),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

//! Receive-only socket transport.
//!
//! Every open room holds one socket subscription; a second, room-independent
//! subscription keeps the room list current. The socket only delivers: all
//! mutations go over REST. A room that cannot open its socket stays usable,
//! it just loses live updates.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::ClientError;
use crate::AuthProvider;
use shared::domain::RoomId;
use shared::protocol::InboundFrame;

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomChannel {
    /// Pushes scoped to one room: messages, seen updates.
    Room(RoomId),
    /// Account-wide room list updates.
    List,
}

impl RoomChannel {
    fn path(self) -> String {
        match self {
            Self::Room(room_id) => format!("/ws/rooms/{}/", room_id.0),
            Self::List => "/ws/rooms/".to_string(),
        }
    }
}

/// A live socket subscription. Dropping it (or calling
/// [`close`](Self::close)) tears down the reader task; the server side
/// notices on its next write.
#[derive(Debug)]
pub struct RoomSubscription {
    channel: RoomChannel,
    frames: mpsc::Receiver<InboundFrame>,
    reader: JoinHandle<()>,
}

impl RoomSubscription {
    pub fn channel(&self) -> RoomChannel {
        self.channel
    }

    /// Receive the next frame. `None` once the socket has closed.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.frames.recv().await
    }

    pub fn close(self) {
        self.reader.abort();
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Open a socket subscription on `channel`, authenticating with a bearer
/// token in the query string. Fails with
/// [`ClientError::TransportUnavailable`] when no token is resolvable or the
/// connection cannot be established.
pub async fn subscribe(
    server_url: &str,
    channel: RoomChannel,
    auth: &dyn AuthProvider,
    buffer: usize,
) -> Result<RoomSubscription, ClientError> {
    let token = auth
        .bearer_token()
        .ok_or_else(|| ClientError::TransportUnavailable("no auth token".to_string()))?;

    let mut ws_url = Url::parse(server_url)
        .map_err(|err| ClientError::TransportUnavailable(err.to_string()))?;
    let scheme = match ws_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ClientError::TransportUnavailable(format!(
                "server url must be http(s), got {other}"
            )));
        }
    };
    if ws_url.set_scheme(scheme).is_err() {
        return Err(ClientError::TransportUnavailable(
            "invalid server url".to_string(),
        ));
    }
    ws_url.set_path(&channel.path());
    ws_url.query_pairs_mut().append_pair("token", &token);

    let (ws_stream, _) = connect_async(ws_url.as_str())
        .await
        .map_err(|err| ClientError::TransportUnavailable(err.to_string()))?;
    let (_, mut ws_reader) = ws_stream.split();

    let (tx, rx) = mpsc::channel(buffer);
    let reader = tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match InboundFrame::parse(&text) {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "dropping malformed socket frame");
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("socket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "socket receive failed");
                    break;
                }
            }
        }
    });

    Ok(RoomSubscription {
        channel,
        frames: rx,
        reader,
    })
}

//! Streaming Session
//!
//! Drives one transcription exchange over one connection:
//! handshake, paced audio transfer, end-of-audio marker, then draining responses.

use futures_util::Stream;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{self, is_clean_close, Connection, WsConnection};
use super::constants::END_OF_AUDIO;
use super::error::{Phase, SessionError};
use super::protocol::{ResponseMessage, SessionConfig};

/// Where a session is in its lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Handshaken,
    Transferred,
    Terminated,
    Draining,
    Closed,
}

/// One transcription exchange over an exclusively owned connection
pub struct StreamingSession<C: Connection = WsConnection> {
    conn: Option<C>,
    config: SessionConfig,
    state: SessionState,
    cancel: CancellationToken,
}

impl StreamingSession<WsConnection> {
    /// Connect to `endpoint` and return a session ready for the handshake
    pub async fn open(endpoint: &str, config: SessionConfig) -> Result<Self, SessionError> {
        let conn = connection::connect(endpoint)
            .await
            .map_err(|e| SessionError::connection(Phase::Open, e))?;
        Ok(Self::new(conn, config))
    }
}

impl<C: Connection> StreamingSession<C> {
    /// Wrap an already established connection
    pub fn new(conn: C, config: SessionConfig) -> Self {
        Self {
            conn: Some(conn),
            config,
            state: SessionState::Connected,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `token` at every pacing delay and while waiting for responses
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Send the session configuration as the first message
    pub async fn handshake(&mut self) -> Result<(), SessionError> {
        self.begin("handshake", SessionState::Connected).await?;

        let payload = match self.config.to_handshake() {
            Ok(payload) => payload,
            Err(e) => {
                self.release().await;
                return Err(e.into());
            }
        };

        self.send(Phase::Handshake, Message::Text(payload)).await?;
        self.state = SessionState::Handshaken;
        info!(
            "Sent handshake (uid: {}, model: {}, language: {}, task: {}, use_vad: {})",
            self.config.uid,
            self.config.model,
            self.config.language,
            self.config.task,
            self.config.use_vad
        );
        Ok(())
    }

    /// Send `audio` as consecutive binary chunks of at most `chunk_size` bytes,
    /// waiting `pacing` between chunks. Returns the number of chunks sent.
    pub async fn transfer(
        &mut self,
        audio: &[u8],
        chunk_size: usize,
        pacing: Duration,
    ) -> Result<usize, SessionError> {
        self.begin("transfer", SessionState::Handshaken).await?;
        if chunk_size == 0 {
            return Err(SessionError::InvalidChunkSize);
        }

        info!("Audio bytes: {}", audio.len());
        let mut sent = 0usize;
        for chunk in audio.chunks(chunk_size) {
            if sent > 0 {
                self.pace(pacing).await?;
            }
            self.send(Phase::Transfer, Message::Binary(chunk.to_vec())).await?;
            sent += 1;

            // Log every 50 chunks
            if sent % 50 == 0 {
                debug!("Sent {} audio chunks", sent);
            }
        }

        self.state = SessionState::Transferred;
        info!("Sent {} audio chunks ({} bytes)", sent, audio.len());
        Ok(sent)
    }

    /// Send the end-of-audio marker
    pub async fn terminate(&mut self) -> Result<(), SessionError> {
        self.begin("terminate", SessionState::Transferred).await?;
        self.send(Phase::Terminate, Message::Binary(END_OF_AUDIO.to_vec()))
            .await?;
        self.state = SessionState::Terminated;
        info!("Sent END_OF_AUDIO");
        Ok(())
    }

    /// Handshake, transfer and terminate in order, leaving the session ready to drain
    pub async fn run(
        &mut self,
        audio: &[u8],
        chunk_size: usize,
        pacing: Duration,
    ) -> Result<(), SessionError> {
        if chunk_size == 0 {
            return Err(SessionError::InvalidChunkSize);
        }
        self.handshake().await?;
        self.transfer(audio, chunk_size, pacing).await?;
        self.terminate().await
    }

    /// Wait for the next server message.
    ///
    /// Returns `Ok(None)` once the server has closed the connection cleanly.
    /// Any other receive failure is returned as a drain-phase connection error.
    /// Either way the connection is released and the session is closed.
    pub async fn next_response(&mut self) -> Result<Option<ResponseMessage>, SessionError> {
        match self.state {
            SessionState::Terminated => {
                self.state = SessionState::Draining;
                info!("Waiting for transcription results");
            }
            SessionState::Draining => {}
            SessionState::Closed => return Err(SessionError::Closed),
            state => {
                return Err(SessionError::InvalidState {
                    operation: "drain",
                    state,
                })
            }
        }

        loop {
            let cancel = self.cancel.clone();
            let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                msg = conn.recv() => Some(msg),
            };

            match received {
                None => {
                    info!("Session cancelled while draining");
                    self.release().await;
                    return Err(SessionError::Cancelled);
                }
                Some(None) => {
                    info!("Server closed the connection");
                    self.release().await;
                    return Ok(None);
                }
                Some(Some(Ok(Message::Close(frame)))) => {
                    info!("Server closed the connection: {:?}", frame);
                    self.release().await;
                    return Ok(None);
                }
                Some(Some(Ok(msg))) => {
                    if let Some(response) = ResponseMessage::from_ws(msg) {
                        info!("RX: {}", response);
                        return Ok(Some(response));
                    }
                }
                Some(Some(Err(e))) if is_clean_close(&e) => {
                    info!("Connection closed: {}", e);
                    self.release().await;
                    return Ok(None);
                }
                Some(Some(Err(e))) => {
                    warn!("Receive failed: {}", e);
                    self.release().await;
                    return Err(SessionError::connection(Phase::Drain, e));
                }
            }
        }
    }

    /// Lazily yield server messages until the connection closes.
    ///
    /// A clean close ends the stream; a failure is yielded once as the last item.
    pub fn drain(&mut self) -> impl Stream<Item = Result<ResponseMessage, SessionError>> + '_ {
        futures_util::stream::unfold(Some(self), |session| async move {
            let Some(session) = session else {
                return None;
            };
            match session.next_response().await {
                Ok(Some(msg)) => Some((Ok(msg), Some(session))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Release the connection. Safe to call in any state, more than once.
    pub async fn close(&mut self) {
        self.release().await;
    }

    async fn begin(
        &mut self,
        operation: &'static str,
        expected: SessionState,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.cancel.is_cancelled() {
            info!("Session cancelled before {}", operation);
            self.release().await;
            return Err(SessionError::Cancelled);
        }
        if self.state != expected {
            return Err(SessionError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    async fn send(&mut self, phase: Phase, msg: Message) -> Result<(), SessionError> {
        let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
        let result = conn.send(msg).await;
        if let Err(e) = result {
            warn!("Send failed during {}: {}", phase, e);
            self.release().await;
            return Err(SessionError::connection(phase, e));
        }
        Ok(())
    }

    async fn pace(&mut self, delay: Duration) -> Result<(), SessionError> {
        let cancel = self.cancel.clone();
        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        if cancelled {
            info!("Session cancelled during transfer");
            self.release().await;
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    async fn release(&mut self) {
        self.state = SessionState::Closed;
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!("Close after shutdown: {}", e);
            }
            info!("Connection released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::{StreamExt, TryStreamExt};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio_tungstenite::tungstenite::error::ProtocolError;
    use tokio_tungstenite::tungstenite::Error as WsError;

    /// Everything the session did to the connection, shared with the test
    #[derive(Clone, Default)]
    struct Wire {
        sent: Arc<Mutex<Vec<Message>>>,
        closes: Arc<AtomicUsize>,
    }

    impl Wire {
        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct ScriptedConnection {
        wire: Wire,
        inbound: VecDeque<Result<Message, WsError>>,
        fail_send_at: Option<usize>,
        hang_when_empty: bool,
    }

    impl ScriptedConnection {
        fn new(wire: &Wire) -> Self {
            Self {
                wire: wire.clone(),
                inbound: VecDeque::new(),
                fail_send_at: None,
                hang_when_empty: false,
            }
        }

        fn reply(mut self, msg: Result<Message, WsError>) -> Self {
            self.inbound.push_back(msg);
            self
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn send(&mut self, msg: Message) -> Result<(), WsError> {
            let mut sent = self.wire.sent.lock().unwrap();
            if self.fail_send_at == Some(sent.len()) {
                return Err(WsError::Io(io::Error::from(io::ErrorKind::ConnectionReset)));
            }
            sent.push(msg);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<Message, WsError>> {
            match self.inbound.pop_front() {
                Some(msg) => Some(msg),
                None if self.hang_when_empty => std::future::pending().await,
                None => None,
            }
        }

        async fn close(&mut self) -> Result<(), WsError> {
            self.wire.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scenario_config() -> SessionConfig {
        SessionConfig::new("test-1700000000", "small", "tl")
    }

    fn audio(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn binary_sizes(sent: &[Message]) -> Vec<usize> {
        sent.iter()
            .map(|m| match m {
                Message::Binary(data) => data.len(),
                other => panic!("expected binary message, got {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn scenario_a_chunks_then_sentinel() {
        let wire = Wire::default();
        let mut session = StreamingSession::new(ScriptedConnection::new(&wire), scenario_config());
        let data = audio(10_000);

        session.run(&data, 4096, Duration::ZERO).await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);

        let sent = wire.sent();
        assert_eq!(sent.len(), 5);
        let handshake = match &sent[0] {
            Message::Text(text) => text.clone(),
            other => panic!("expected handshake text, got {:?}", other),
        };
        let value: serde_json::Value = serde_json::from_str(&handshake).unwrap();
        assert_eq!(value["uid"], "test-1700000000");
        assert_eq!(value["task"], "transcribe");

        assert_eq!(binary_sizes(&sent[1..]), vec![4096, 4096, 1808, 12]);
        assert_eq!(sent[4], Message::Binary(b"END_OF_AUDIO".to_vec()));

        let rebuilt: Vec<u8> = sent[1..4]
            .iter()
            .flat_map(|m| m.clone().into_data())
            .collect();
        assert_eq!(rebuilt, data);
    }

    #[tokio::test]
    async fn scenario_b_empty_audio_sends_no_chunks() {
        let wire = Wire::default();
        let mut session = StreamingSession::new(ScriptedConnection::new(&wire), scenario_config());

        session.handshake().await.unwrap();
        let chunks = session.transfer(&[], 4096, Duration::ZERO).await.unwrap();
        session.terminate().await.unwrap();

        assert_eq!(chunks, 0);
        let sent = wire.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Message::Text(_)));
        assert_eq!(sent[1], Message::Binary(END_OF_AUDIO.to_vec()));
    }

    #[tokio::test]
    async fn chunk_count_matches_ceiling_division() {
        for (len, chunk_size) in [(1, 1), (7, 3), (4096, 4096), (4097, 4096), (100, 1000)] {
            let wire = Wire::default();
            let mut session =
                StreamingSession::new(ScriptedConnection::new(&wire), scenario_config());
            let data = audio(len);

            session.handshake().await.unwrap();
            let chunks = session.transfer(&data, chunk_size, Duration::ZERO).await.unwrap();

            assert_eq!(chunks, (len + chunk_size - 1) / chunk_size);
            let rebuilt: Vec<u8> = wire.sent()[1..]
                .iter()
                .flat_map(|m| m.clone().into_data())
                .collect();
            assert_eq!(rebuilt, data);
        }
    }

    #[tokio::test]
    async fn scenario_c_immediate_close_drains_nothing() {
        let wire = Wire::default();
        let mut session = StreamingSession::new(ScriptedConnection::new(&wire), scenario_config());
        session.run(&audio(10), 4, Duration::ZERO).await.unwrap();

        let responses: Vec<ResponseMessage> = session.drain().try_collect().await.unwrap();

        assert!(responses.is_empty());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(wire.closes(), 1);
    }

    #[tokio::test]
    async fn scenario_d_send_failure_aborts_before_terminate() {
        let wire = Wire::default();
        let mut conn = ScriptedConnection::new(&wire);
        // handshake is message 0, chunk 1 is message 1, chunk 2 is message 2
        conn.fail_send_at = Some(2);
        let mut session = StreamingSession::new(conn, scenario_config());

        session.handshake().await.unwrap();
        let err = session
            .transfer(&audio(10_000), 4096, Duration::ZERO)
            .await
            .unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Transfer));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(wire.closes(), 1);

        assert!(matches!(session.terminate().await, Err(SessionError::Closed)));
        let sent = wire.sent();
        assert_eq!(sent.len(), 2);
        assert!(!sent.contains(&Message::Binary(END_OF_AUDIO.to_vec())));
    }

    #[tokio::test]
    async fn handshake_send_failure_closes_session() {
        let wire = Wire::default();
        let mut conn = ScriptedConnection::new(&wire);
        conn.fail_send_at = Some(0);
        let mut session = StreamingSession::new(conn, scenario_config());
        assert_eq!(session.config().uid, "test-1700000000");

        let err = session.handshake().await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Handshake));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(wire.closes(), 1);
        assert!(matches!(
            session.transfer(&audio(10), 4, Duration::ZERO).await,
            Err(SessionError::Closed)
        ));
        assert!(wire.sent().is_empty());
        assert_eq!(wire.closes(), 1);
    }

    #[tokio::test]
    async fn sentinel_send_failure_closes_session() {
        let wire = Wire::default();
        let mut conn = ScriptedConnection::new(&wire);
        // handshake is message 0, so with no audio the sentinel is message 1
        conn.fail_send_at = Some(1);
        let mut session = StreamingSession::new(conn, scenario_config());

        session.handshake().await.unwrap();
        session.transfer(&[], 4096, Duration::ZERO).await.unwrap();
        let err = session.terminate().await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Terminate));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(wire.closes(), 1);
        assert!(matches!(session.next_response().await, Err(SessionError::Closed)));
        assert_eq!(wire.sent().len(), 1);
        assert_eq!(wire.closes(), 1);
    }

    #[tokio::test]
    async fn drain_yields_text_and_binary_until_close_frame() {
        let wire = Wire::default();
        let conn = ScriptedConnection::new(&wire)
            .reply(Ok(Message::Text(r#"{"message":"SERVER_READY"}"#.into())))
            .reply(Ok(Message::Ping(vec![9])))
            .reply(Ok(Message::Binary(vec![1, 2, 3])))
            .reply(Ok(Message::Close(None)))
            .reply(Ok(Message::Text("never read".into())));
        let mut session = StreamingSession::new(conn, scenario_config());
        session.run(&[], 4096, Duration::ZERO).await.unwrap();

        let responses: Vec<ResponseMessage> = session.drain().try_collect().await.unwrap();

        assert_eq!(
            responses,
            vec![
                ResponseMessage::Text(r#"{"message":"SERVER_READY"}"#.into()),
                ResponseMessage::Binary(vec![1, 2, 3]),
            ]
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(wire.closes(), 1);
    }

    #[tokio::test]
    async fn connection_closed_error_is_a_clean_end() {
        let wire = Wire::default();
        let conn = ScriptedConnection::new(&wire)
            .reply(Ok(Message::Text("partial".into())))
            .reply(Err(WsError::ConnectionClosed));
        let mut session = StreamingSession::new(conn, scenario_config());
        session.run(&[], 4096, Duration::ZERO).await.unwrap();

        assert!(session.next_response().await.unwrap().is_some());
        assert!(session.next_response().await.unwrap().is_none());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn dropped_connection_surfaces_as_drain_error() {
        let wire = Wire::default();
        let conn = ScriptedConnection::new(&wire)
            .reply(Ok(Message::Text("partial".into())))
            .reply(Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)));
        let mut session = StreamingSession::new(conn, scenario_config());
        session.run(&[], 4096, Duration::ZERO).await.unwrap();

        let items: Vec<_> = session.drain().collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        match &items[1] {
            Err(e) => assert_eq!(e.phase(), Some(Phase::Drain)),
            Ok(msg) => panic!("expected drain error, got {:?}", msg),
        }
        assert_eq!(wire.closes(), 1);
    }

    #[tokio::test]
    async fn operations_after_close_fail_without_io() {
        let wire = Wire::default();
        let mut session = StreamingSession::new(ScriptedConnection::new(&wire), scenario_config());
        session.run(&audio(5), 2, Duration::ZERO).await.unwrap();
        assert!(session.next_response().await.unwrap().is_none());
        let sent_before = wire.sent().len();

        assert!(matches!(session.handshake().await, Err(SessionError::Closed)));
        assert!(matches!(
            session.transfer(&audio(5), 2, Duration::ZERO).await,
            Err(SessionError::Closed)
        ));
        assert!(matches!(session.terminate().await, Err(SessionError::Closed)));
        assert!(matches!(session.next_response().await, Err(SessionError::Closed)));
        session.close().await;

        assert_eq!(wire.sent().len(), sent_before);
        assert_eq!(wire.closes(), 1);
    }

    #[tokio::test]
    async fn phases_cannot_be_skipped() {
        let wire = Wire::default();
        let mut session = StreamingSession::new(ScriptedConnection::new(&wire), scenario_config());

        assert!(matches!(
            session.terminate().await,
            Err(SessionError::InvalidState {
                operation: "terminate",
                state: SessionState::Connected
            })
        ));
        assert!(matches!(
            session.next_response().await,
            Err(SessionError::InvalidState { operation: "drain", .. })
        ));
        session.handshake().await.unwrap();
        assert!(matches!(
            session.handshake().await,
            Err(SessionError::InvalidState { .. })
        ));

        assert_eq!(wire.sent().len(), 1);
        assert_eq!(session.state(), SessionState::Handshaken);
    }

    #[tokio::test]
    async fn zero_chunk_size_is_rejected_before_sending() {
        let wire = Wire::default();
        let mut session = StreamingSession::new(ScriptedConnection::new(&wire), scenario_config());

        assert!(matches!(
            session.run(&audio(10), 0, Duration::ZERO).await,
            Err(SessionError::InvalidChunkSize)
        ));
        assert!(wire.sent().is_empty());

        session.handshake().await.unwrap();
        assert!(matches!(
            session.transfer(&audio(10), 0, Duration::ZERO).await,
            Err(SessionError::InvalidChunkSize)
        ));
        assert_eq!(wire.sent().len(), 1);
        assert_eq!(session.state(), SessionState::Handshaken);
    }

    #[tokio::test]
    async fn cancel_while_draining_releases_connection() {
        let wire = Wire::default();
        let mut conn = ScriptedConnection::new(&wire).reply(Ok(Message::Text("first".into())));
        conn.hang_when_empty = true;
        let token = CancellationToken::new();
        let mut session =
            StreamingSession::new(conn, scenario_config()).with_cancellation(token.clone());
        session.run(&[], 4096, Duration::ZERO).await.unwrap();

        assert_eq!(
            session.next_response().await.unwrap(),
            Some(ResponseMessage::Text("first".into()))
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        assert!(matches!(session.next_response().await, Err(SessionError::Cancelled)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(wire.closes(), 1);
        assert!(matches!(session.next_response().await, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn cancel_during_pacing_stops_transfer() {
        let wire = Wire::default();
        let token = CancellationToken::new();
        let mut session = StreamingSession::new(ScriptedConnection::new(&wire), scenario_config())
            .with_cancellation(token.clone());
        session.handshake().await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = session
            .transfer(&audio(100), 10, Duration::from_secs(60))
            .await;

        assert!(matches!(result, Err(SessionError::Cancelled)));
        // handshake plus the first chunk
        assert_eq!(wire.sent().len(), 2);
        assert_eq!(wire.closes(), 1);
    }
}

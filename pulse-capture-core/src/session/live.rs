use std::sync::Arc;

use super::capture::{CaptureSession, ControlQuery, ControlReply, SessionRuntime};
use crate::mainloop::connection::Connection;
use crate::mainloop::registry::LoopRegistry;
use crate::models::config::CaptureConfiguration;
use crate::models::error::CaptureError;
use crate::models::state::CaptureState;
use crate::traits::server::AudioServer;
use crate::traits::sink::SampleSink;

/// A capture session together with the connection it runs on.
pub struct LiveCapture {
    // Field order matters: the session is closed before its connection.
    session: CaptureSession,
    connection: Connection,
}

/// Open a live capture on the process-wide loop.
pub fn open_capture(
    server: &dyn AudioServer,
    sink: Arc<dyn SampleSink>,
    config: &CaptureConfiguration,
) -> Result<LiveCapture, CaptureError> {
    open_capture_in(
        &LoopRegistry::global(),
        server,
        sink,
        config,
        SessionRuntime::default(),
    )
}

/// Connect as `config.user_agent` on `registry`'s loop and open a record
/// stream. Nothing is left behind on failure.
pub fn open_capture_in(
    registry: &Arc<LoopRegistry>,
    server: &dyn AudioServer,
    sink: Arc<dyn SampleSink>,
    config: &CaptureConfiguration,
    runtime: SessionRuntime,
) -> Result<LiveCapture, CaptureError> {
    config.validate().map_err(CaptureError::ConfigurationFailed)?;

    let connection = Connection::connect_in(registry, server, &config.user_agent)?;
    let session = CaptureSession::open_with(&connection, sink, config, runtime)?;
    log::info!(
        "[{}] capturing from {} on connection {}",
        session.id(),
        config.source.as_deref().unwrap_or("default source"),
        connection.id()
    );

    Ok(LiveCapture {
        session,
        connection,
    })
}

impl LiveCapture {
    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> CaptureState {
        self.session.state()
    }

    pub fn control(&self, query: ControlQuery) -> Result<ControlReply, CaptureError> {
        self.session.control(query)
    }

    /// Close the stream, then the connection.
    pub fn close(self) {
        let Self {
            session,
            connection,
        } = self;
        session.close();
        connection.disconnect();
    }
}

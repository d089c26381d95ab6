// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Guest command transport.
//!
//! Every guest adapter connects to the mediator's Unix socket and streams
//! fixed-size [`RawCommand`] records. Each connection gets its own thread
//! and its own [`Context`]; reads are answered with the 4-byte
//! little-endian result.

use std::{
    fs,
    io::{self, Read, Write},
    os::unix::net::UnixListener,
    path::PathBuf,
    sync::Arc,
    thread,
};

use log::{debug, error, info, warn};
use thiserror::Error as ThisError;
use vm_memory::ByteValued;

use crate::{
    command::{Command, RawCommand},
    context::Context,
    device::{self, Device},
    MediatorConfig,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Failed to bind socket {0}: {1}")]
    Bind(PathBuf, io::Error),
    #[error("Failed to accept connection: {0}")]
    Accept(io::Error),
    #[error("Failed to spawn session thread: {0}")]
    Spawn(io::Error),
    #[error("Transport error: {0}")]
    Io(io::Error),
    #[error("No virtual GPU available: {0}")]
    NoVirtId(device::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        Self::new(io::ErrorKind::Other, e)
    }
}

/// Listens on the configured socket and serves guests until accepting a
/// connection fails.
pub fn serve(config: &MediatorConfig, device: Arc<Device>) -> Result<()> {
    let path = config.socket_path();
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            return Err(Error::Bind(path.to_path_buf(), e));
        }
        _ => {}
    }
    let listener =
        UnixListener::bind(path).map_err(|e| Error::Bind(path.to_path_buf(), e))?;
    info!("Listening on {}", path.display());

    serve_listener(&listener, &device, config.through())
}

pub fn serve_listener(listener: &UnixListener, device: &Arc<Device>, through: bool) -> Result<()> {
    for (n, stream) in listener.incoming().enumerate() {
        let stream = stream.map_err(Error::Accept)?;
        let device = Arc::clone(device);
        thread::Builder::new()
            .name(format!("vgpu-session-{n}"))
            .spawn(move || {
                if let Err(e) = run_session(stream, device, through) {
                    error!("{e}");
                }
            })
            .map_err(Error::Spawn)?;
    }
    Ok(())
}

/// Drives one guest connection until the peer hangs up.
pub fn run_session<S: Read + Write>(
    mut stream: S,
    device: Arc<Device>,
    through: bool,
) -> Result<()> {
    let mut context = Context::new(device, through);
    context.accept().map_err(Error::NoVirtId)?;

    let mut raw = RawCommand::default();
    loop {
        match stream.read_exact(raw.as_mut_slice()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Session closed");
                return Ok(());
            }
            Err(e) => return Err(Error::Io(e)),
        }

        let command = match Command::decode(&raw) {
            Ok(command) => command,
            Err(e) => {
                warn!("Dropping command: {e}");
                continue;
            }
        };
        context.handle(&command);
        if command.is_read() {
            stream
                .write_all(&context.result().to_le_bytes())
                .map_err(Error::Io)?;
        }
    }
}

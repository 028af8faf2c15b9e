use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use parley_structs::timestamp::Timestamp;

use crate::roster::{Roster, User};

const CHUNK_SIZE: usize = 4096;

/// The shared, lockable write half of a session socket. Frames are UTF-8
/// terminated by a NUL byte; a NUL inside a payload is a protocol
/// violation.
pub struct SessionWriter {
    stream: Mutex<TcpStream>,
    pub peer: SocketAddr,
}

impl SessionWriter {
    pub fn send(&self, frame: &str) -> anyhow::Result<()> {
        tracing::debug!(peer = %self.peer, "<- {frame}");
        if frame.as_bytes().contains(&0) {
            anyhow::bail!("frame contains a premature null byte");
        }
        let mut stream = self.stream.lock().expect("session write lock poisoned");
        stream.write_all(frame.as_bytes())?;
        stream.write_all(&[0])?;
        Ok(())
    }
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("{0}")]
    Protocol(String),
    #[error("session closed")]
    Death,
}

struct Session {
    reader: TcpStream,
    writer: Arc<SessionWriter>,
    buffer: Vec<u8>,
    roster: Roster,
    user: Option<Arc<User>>,
}

/// Runs one client connection to completion. Called on its own thread.
pub fn run(roster: Roster, stream: TcpStream) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(err) => {
            tracing::debug!("dropping connection without a peer address: {err}");
            return;
        }
    };
    let write_half = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            tracing::debug!(peer = %peer, "could not split connection: {err}");
            return;
        }
    };
    let mut session = Session {
        reader: stream,
        writer: Arc::new(SessionWriter {
            stream: Mutex::new(write_half),
            peer,
        }),
        buffer: Vec::new(),
        roster,
        user: None,
    };
    let _ = session.handle();
    session.finish();
}

impl Session {
    fn read_frame(&mut self) -> Result<String, SessionError> {
        loop {
            if let Some(terminator) = self.buffer.iter().position(|&byte| byte == 0) {
                let frame = String::from_utf8_lossy(&self.buffer[..terminator]).into_owned();
                self.buffer.drain(..=terminator);
                tracing::debug!(peer = %self.writer.peer, "-> {frame}");
                return Ok(frame);
            }
            let mut chunk = [0u8; CHUNK_SIZE];
            let read = self.reader.read(&mut chunk).map_err(|_| SessionError::Death)?;
            if read == 0 {
                return Err(SessionError::Death);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    fn send(&self, frame: &str) -> Result<(), SessionError> {
        self.writer.send(frame).map_err(|_| SessionError::Death)
    }

    /// Reads the opening REGISTER/LOGIN exchange and binds the session to
    /// a user, holding their login gate.
    fn associate(&mut self) -> Result<Arc<User>, SessionError> {
        let opener = self.read_frame()?;
        let mut parts = opener.split_whitespace();
        let (Some(command), Some(username), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(SessionError::Protocol(
                "Username must not contain whitespace or be empty.".into(),
            ));
        };
        let password = self.read_frame()?;

        let user = match command {
            "REGISTER" => self.roster.register(username, &password).ok_or_else(|| {
                SessionError::Protocol(format!("Username \"{username}\" is not available."))
            })?,
            "LOGIN" => {
                let user = self
                    .roster
                    .get(username)
                    .ok_or_else(|| SessionError::Protocol("Incorrect username.".into()))?;
                if user.password != password {
                    return Err(SessionError::Protocol("Incorrect password.".into()));
                }
                if !user.try_acquire_gate() {
                    user.send(&format!(
                        "ADMIN Someone from {} tried to log in as you and guessed your password correctly.",
                        self.writer.peer
                    ));
                    return Err(SessionError::Protocol(format!(
                        "{username} is already logged in; are you trying to break in?"
                    )));
                }
                user
            }
            _ => {
                return Err(SessionError::Protocol(
                    "Must LOGIN or REGISTER to begin session.".into(),
                ));
            }
        };
        user.attach(self.writer.clone());
        self.user = Some(user.clone());
        Ok(user)
    }

    fn handle(&mut self) -> Result<(), SessionError> {
        let user = loop {
            match self.associate() {
                Ok(user) => break user,
                Err(SessionError::Protocol(detail)) => self.send(&format!("ERROR {detail}"))?,
                Err(err) => return Err(err),
            }
        };
        self.send("SUCCESS You are logged in.")?;
        for frame in user.take_queued() {
            self.send(&frame)?;
        }

        loop {
            let line = self.read_frame()?;
            let mut parts = line.splitn(2, char::is_whitespace);
            let command = parts.next().unwrap_or_default();
            let rest = parts.next();
            match command {
                "DELETE" => {
                    self.roster.remove(&user.username);
                    self.send("DELETED Account deleted; you are being disconnected.")?;
                    return Ok(());
                }
                "LIST" => {
                    if let Err(SessionError::Protocol(detail)) = self.list(rest.unwrap_or("*")) {
                        self.send(&format!("ERROR {detail}"))?;
                    }
                }
                "MESSAGE" => {
                    let result = match rest.and_then(|rest| split_once_whitespace(rest)) {
                        Some((to, body)) => self.message(&user, to, body),
                        None => Err(SessionError::Protocol("Incorrect message format.".into())),
                    };
                    match result {
                        Ok(()) => {}
                        Err(SessionError::Protocol(detail)) => {
                            self.send(&format!("ERROR {detail}"))?;
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ => self.send("ERROR Unknown command.")?,
            }
        }
    }

    fn message(&self, user: &User, to: &str, body: &str) -> Result<(), SessionError> {
        let Some(recipient) = self.roster.get(to) else {
            return Err(SessionError::Protocol(format!(
                "{to} is not a user; try LIST to see available users."
            )));
        };
        recipient.send(&format!(
            "MESSAGE {}\nSent: {}\n{}",
            user.username,
            Timestamp::now(),
            body
        ));
        self.send("SENT")
    }

    fn list(&self, pattern: &str) -> Result<(), SessionError> {
        let matched = self
            .roster
            .matching(pattern)
            .map_err(|_| SessionError::Protocol("Invalid glob pattern.".into()))?;
        let mut listing = String::from("LISTING");
        for (name, online) in matched {
            listing.push('\n');
            listing.push_str(&name);
            if online {
                listing.push_str(" (online)");
            }
        }
        self.send(&listing)
    }

    fn finish(&mut self) {
        if let Some(user) = self.user.take() {
            user.detach();
            user.release_gate();
        }
    }
}

fn split_once_whitespace(text: &str) -> Option<(&str, &str)> {
    let mut parts = text.splitn(2, char::is_whitespace);
    match (parts.next(), parts.next()) {
        (Some(head), Some(tail)) => Some((head, tail)),
        _ => None,
    }
}

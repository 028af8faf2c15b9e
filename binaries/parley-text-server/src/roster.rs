use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use glob::{Pattern, PatternError};

use crate::session::SessionWriter;

/// One registered account: credentials, the attached session if any, the
/// held-back frames for when there is none, and the one-holder login
/// gate.
pub struct User {
    pub username: String,
    pub password: String,
    session: Mutex<Option<Arc<SessionWriter>>>,
    queue: Mutex<VecDeque<String>>,
    gate: AtomicBool,
}

impl User {
    /// A fresh account. The registering session holds the gate from the
    /// start.
    fn new(username: &str, password: &str) -> Arc<Self> {
        Arc::new(Self {
            username: username.to_string(),
            password: password.to_string(),
            session: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            gate: AtomicBool::new(true),
        })
    }

    /// Delivers a frame now if a session is attached, otherwise holds it
    /// for the next login.
    pub fn send(&self, frame: &str) {
        let session = self
            .session
            .lock()
            .expect("user session lock poisoned")
            .clone();
        let delivered = match session {
            Some(writer) => writer.send(frame).is_ok(),
            None => false,
        };
        if !delivered {
            self.queue
                .lock()
                .expect("user queue lock poisoned")
                .push_back(frame.to_string());
        }
    }

    pub fn attach(&self, writer: Arc<SessionWriter>) {
        *self.session.lock().expect("user session lock poisoned") = Some(writer);
    }

    pub fn detach(&self) {
        *self.session.lock().expect("user session lock poisoned") = None;
    }

    pub fn online(&self) -> bool {
        self.session
            .lock()
            .expect("user session lock poisoned")
            .is_some()
    }

    /// Drains the frames that piled up while the user was offline.
    pub fn take_queued(&self) -> Vec<String> {
        self.queue
            .lock()
            .expect("user queue lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn try_acquire_gate(&self) -> bool {
        self.gate
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release_gate(&self) {
        self.gate.store(false, Ordering::SeqCst);
    }
}

/// The in-memory account directory, shared by every session thread.
#[derive(Clone, Default)]
pub struct Roster {
    inner: Arc<Mutex<HashMap<String, Arc<User>>>>,
}

impl Roster {
    /// Creates the account, or returns `None` if the name is taken.
    pub fn register(&self, username: &str, password: &str) -> Option<Arc<User>> {
        let mut table = self.inner.lock().expect("roster lock poisoned");
        if table.contains_key(username) {
            return None;
        }
        let user = User::new(username, password);
        table.insert(username.to_string(), user.clone());
        Some(user)
    }

    pub fn get(&self, username: &str) -> Option<Arc<User>> {
        self.inner
            .lock()
            .expect("roster lock poisoned")
            .get(username)
            .cloned()
    }

    pub fn remove(&self, username: &str) {
        self.inner
            .lock()
            .expect("roster lock poisoned")
            .remove(username);
    }

    /// Usernames matching a shell-style glob, with their online flag.
    pub fn matching(&self, pattern: &str) -> Result<Vec<(String, bool)>, PatternError> {
        let pattern = Pattern::new(pattern)?;
        let table = self.inner.lock().expect("roster lock poisoned");
        let mut matched: Vec<(String, bool)> = table
            .values()
            .filter(|user| pattern.matches(&user.username))
            .map(|user| (user.username.clone(), user.online()))
            .collect();
        matched.sort();
        Ok(matched)
    }
}

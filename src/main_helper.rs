use crate::constants::{DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TTL_SECS};
use crate::engine::RetraceEngine;
use crate::session::MemorySessionStore;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    pub max_body_size: usize,
    /// Seconds a session stays retrievable; 0 disables expiry
    #[arg(long, default_value_t = DEFAULT_SESSION_TTL_SECS)]
    pub session_ttl_secs: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,
    /// Mask credential headers in served records
    #[arg(long, default_value_t = false)]
    pub redact_secrets: bool,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    /// Print request summaries for a log file and exit
    #[arg(long)]
    pub inspect: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
            max_body_size: 100 * 1024 * 1024,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            redact_secrets: false,
            log_dir: "logs".to_string(),
            inspect: None,
        }
    }
}

impl Args {
    pub fn session_ttl(&self) -> Option<Duration> {
        if self.session_ttl_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.session_ttl_secs))
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: RetraceEngine,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(args: Args) -> Self {
        let store = Arc::new(MemorySessionStore::new(args.session_ttl(), args.max_sessions));
        Self {
            engine: RetraceEngine::new(store),
            args: Arc::new(args),
        }
    }
}

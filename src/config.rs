//! Connection settings: size limits, write timeouts and keep-alive cadence.

use std::time::Duration;

use crate::error::{Error, Result};

/// Size caps applied to frames and messages in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Largest single frame payload, in bytes. Defaults to 16 MiB.
    pub max_frame_size: usize,

    /// Largest outgoing message, in bytes. Defaults to 64 MiB.
    pub max_message_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self::new(16 << 20, 64 << 20)
    }
}

impl Limits {
    #[must_use]
    pub const fn new(max_frame_size: usize, max_message_size: usize) -> Self {
        Self {
            max_frame_size,
            max_message_size,
        }
    }

    /// # Errors
    ///
    /// `Error::MessageTooLarge` when `size` is over `max_message_size`.
    pub const fn check_message_size(&self, size: usize) -> Result<()> {
        if size <= self.max_message_size {
            return Ok(());
        }
        Err(Error::MessageTooLarge {
            size,
            max: self.max_message_size,
        })
    }

    /// # Errors
    ///
    /// `Error::FrameTooLarge` when `size` is over `max_frame_size`.
    pub const fn check_frame_size(&self, size: usize) -> Result<()> {
        if size <= self.max_frame_size {
            return Ok(());
        }
        Err(Error::FrameTooLarge {
            size,
            max: self.max_frame_size,
        })
    }
}

/// Deadlines for the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Longest a single frame write may take. A write that overruns fails
    /// with `ErrorKind::TimedOut` and the writer still hands the lock on.
    /// Defaults to 60 seconds.
    pub write: Duration,

    /// Idle period of the connection. Without an explicit
    /// `idle_ping_interval`, keep-alive pings go out at half this value.
    /// Defaults to 5 minutes.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(300))
    }
}

impl Timeouts {
    #[must_use]
    pub const fn new(write: Duration, idle: Duration) -> Self {
        Self { write, idle }
    }
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub limits: Limits,

    /// Let a server take unmasked frames from its client. RFC 6455 forbids
    /// this; it exists for test peers. Off by default.
    pub accept_unmasked_frames: bool,

    /// Initial capacity of the read buffer. 8 KiB by default.
    pub read_buffer_size: usize,

    /// Write deadlines. `None` (the default) lets a write wait on the
    /// transport forever.
    pub timeouts: Option<Timeouts>,

    /// Period of [`Connection::spawn_keepalive`](crate::Connection::spawn_keepalive).
    /// `None` by default.
    pub idle_ping_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            accept_unmasked_frames: false,
            read_buffer_size: 8 << 10,
            timeouts: None,
            idle_ping_interval: None,
        }
    }
}

impl Config {
    /// Same as [`Config::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the size caps.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub const fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Enable write deadlines and the idle-derived keep-alive period.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Set the idle keep-alive ping interval.
    #[must_use]
    pub const fn with_idle_ping_interval(mut self, interval: Duration) -> Self {
        self.idle_ping_interval = Some(interval);
        self
    }

    /// Interval the keep-alive task ticks at, if any.
    ///
    /// An explicit `idle_ping_interval` wins; otherwise half of the idle
    /// timeout is used.
    #[must_use]
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.idle_ping_interval
            .or_else(|| self.timeouts.as_ref().map(|t| t.idle / 2))
            .filter(|d| !d.is_zero())
    }
}

//! Repeat counting and release detection for decoded buttons.
//!
//! Remotes only transmit while a button is held, so a release is never
//! observed directly. Instead, a button is considered released once no
//! further decode of it has arrived within the repeat timeout. The event loop
//! asks for [`DecodeState::next_deadline`] when deciding how long to wait, and
//! calls [`DecodeState::expire`] once it has passed.

use log::{debug, trace};
use std::time::{Duration, Instant};

/// Default for the maximum number of repeats reported for one press
pub const DEFAULT_REPEAT_MAX: u32 = 600;

/// Default time without decodes after which a button counts as released
pub const DEFAULT_REPEAT_TIMEOUT: Duration = Duration::from_millis(200);

/// A button press, repeat or release ready to be sent to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub remote: String,
    pub button: String,
    pub code: u64,
    pub repeat: u32,
    pub release: bool,
}

/// What a hardware driver or peer reports: a button was seen, nothing more
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decode {
    pub remote: String,
    pub button: String,
    pub code: u64,
}

#[derive(Debug, Clone)]
struct Repeating {
    remote: String,
    button: String,
    code: u64,
    deadline: Instant,
}

#[derive(Debug)]
pub struct DecodeState {
    /// Remote of the press in progress
    decoding: Option<String>,
    /// Remote of the most recent press, kept after release for diagnostics
    last_remote: Option<String>,
    repeating: Option<Repeating>,
    reps: u32,
    repeat_max: u32,
    repeat_timeout: Duration,
}

impl DecodeState {
    pub fn new(repeat_max: u32, repeat_timeout: Duration) -> Self {
        DecodeState {
            decoding: None,
            last_remote: None,
            repeating: None,
            reps: 0,
            repeat_max,
            repeat_timeout,
        }
    }

    pub fn decoding(&self) -> Option<&str> {
        self.decoding.as_deref()
    }

    pub fn last_remote(&self) -> Option<&str> {
        self.last_remote.as_deref()
    }

    /// The remote and button currently held, if any
    pub fn repeating(&self) -> Option<(&str, &str)> {
        self.repeating
            .as_ref()
            .map(|r| (r.remote.as_str(), r.button.as_str()))
    }

    pub fn reps(&self) -> u32 {
        self.reps
    }

    /// Feed a decoded button. Returns the events to broadcast, in order: a
    /// release of the previously held button if another one was pressed,
    /// followed by the press or repeat. Repeats beyond the maximum are
    /// swallowed, but still keep the button held.
    ///
    /// The timeout is the remote's own repeat timeout, if it has one.
    pub fn decode(
        &mut self,
        decode: Decode,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Vec<DecodedEvent> {
        let timeout = timeout.unwrap_or(self.repeat_timeout);
        let mut events = Vec::new();

        if let Some(repeating) = &mut self.repeating {
            if repeating.remote == decode.remote
                && repeating.button == decode.button
                && now < repeating.deadline
            {
                repeating.deadline = now + timeout;

                if self.reps >= self.repeat_max {
                    trace!(
                        "suppressing repeat of {} {}, limit {} reached",
                        decode.remote,
                        decode.button,
                        self.repeat_max
                    );
                    return events;
                }

                self.reps += 1;

                events.push(DecodedEvent {
                    remote: decode.remote,
                    button: decode.button,
                    code: decode.code,
                    repeat: self.reps,
                    release: false,
                });

                return events;
            }

            if let Some(release) = self.release_current() {
                events.push(release);
            }
        }

        debug!("press of {} {}", decode.remote, decode.button);

        self.reps = 0;
        self.decoding = Some(decode.remote.clone());
        self.last_remote = Some(decode.remote.clone());
        self.repeating = Some(Repeating {
            remote: decode.remote.clone(),
            button: decode.button.clone(),
            code: decode.code,
            deadline: now + timeout,
        });

        events.push(DecodedEvent {
            remote: decode.remote,
            button: decode.button,
            code: decode.code,
            repeat: 0,
            release: false,
        });

        events
    }

    /// When the held button will be released if nothing else arrives
    pub fn next_deadline(&self) -> Option<Instant> {
        self.repeating.as_ref().map(|r| r.deadline)
    }

    /// Synthesize the release if the held button timed out
    pub fn expire(&mut self, now: Instant) -> Option<DecodedEvent> {
        if self.repeating.as_ref().is_some_and(|r| now >= r.deadline) {
            self.release_current()
        } else {
            None
        }
    }

    /// Release the given button right away, if it is the one being held. Used
    /// when a peer has already told us about the release.
    pub fn release(&mut self, remote: &str, button: &str) -> Option<DecodedEvent> {
        if self
            .repeating
            .as_ref()
            .is_some_and(|r| r.remote == remote && r.button == button)
        {
            self.release_current()
        } else {
            None
        }
    }

    fn release_current(&mut self) -> Option<DecodedEvent> {
        let repeating = self.repeating.take()?;

        debug!(
            "release of {} {} after {} repeats",
            repeating.remote, repeating.button, self.reps
        );

        self.decoding = None;
        self.last_remote = Some(repeating.remote.clone());

        Some(DecodedEvent {
            remote: repeating.remote,
            button: repeating.button,
            code: repeating.code,
            repeat: self.reps,
            release: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(remote: &str, button: &str) -> Decode {
        Decode {
            remote: remote.into(),
            button: button.into(),
            code: 0x10,
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn repeats_count_up_then_release() {
        let mut state = DecodeState::new(DEFAULT_REPEAT_MAX, TIMEOUT);
        let start = Instant::now();

        let mut now = start;
        for reps in 0..5 {
            let events = state.decode(press("tv", "KEY_UP"), None, now);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].repeat, reps);
            assert!(!events[0].release);
            assert_eq!(state.expire(now), None);
            now += Duration::from_millis(50);
        }

        assert_eq!(state.repeating(), Some(("tv", "KEY_UP")));
        assert_eq!(state.decoding(), Some("tv"));

        // last decode was at now - 50ms
        assert_eq!(state.expire(now + Duration::from_millis(40)), None);

        let release = state.expire(now + Duration::from_millis(50)).unwrap();
        assert!(release.release);
        assert_eq!(release.repeat, 4);
        assert_eq!(release.button, "KEY_UP");

        assert_eq!(state.repeating(), None);
        assert_eq!(state.decoding(), None);
        assert_eq!(state.last_remote(), Some("tv"));
        assert_eq!(state.next_deadline(), None);

        // never twice
        assert_eq!(state.expire(now + Duration::from_secs(10)), None);
    }

    #[test]
    fn repeat_max_caps() {
        let mut state = DecodeState::new(2, TIMEOUT);
        let mut now = Instant::now();

        let mut reported = Vec::new();

        for _ in 0..6 {
            for e in state.decode(press("tv", "KEY_UP"), None, now) {
                reported.push(e.repeat);
            }
            now += Duration::from_millis(10);
        }

        assert_eq!(reported, vec![0, 1, 2]);
        // still held, so the deadline moved along
        assert_eq!(state.next_deadline(), Some(now - Duration::from_millis(10) + TIMEOUT));
    }

    #[test]
    fn other_button_releases_first() {
        let mut state = DecodeState::new(DEFAULT_REPEAT_MAX, TIMEOUT);
        let now = Instant::now();

        state.decode(press("tv", "KEY_UP"), None, now);
        state.decode(press("tv", "KEY_UP"), None, now);

        let events = state.decode(press("tv", "KEY_DOWN"), None, now);

        assert_eq!(events.len(), 2);
        assert!(events[0].release);
        assert_eq!(events[0].button, "KEY_UP");
        assert_eq!(events[0].repeat, 1);
        assert!(!events[1].release);
        assert_eq!(events[1].button, "KEY_DOWN");
        assert_eq!(events[1].repeat, 0);
    }

    #[test]
    fn late_decode_is_new_press() {
        let mut state = DecodeState::new(DEFAULT_REPEAT_MAX, TIMEOUT);
        let now = Instant::now();

        state.decode(press("tv", "KEY_UP"), None, now);

        // the tick has not run yet, but the deadline has passed
        let events = state.decode(press("tv", "KEY_UP"), None, now + TIMEOUT);

        assert_eq!(events.len(), 2);
        assert!(events[0].release);
        assert_eq!(events[1].repeat, 0);
        assert!(!events[1].release);
    }

    #[test]
    fn remote_timeout_overrides_default() {
        let mut state = DecodeState::new(DEFAULT_REPEAT_MAX, TIMEOUT);
        let now = Instant::now();

        state.decode(press("tv", "KEY_UP"), Some(Duration::from_secs(1)), now);

        assert_eq!(state.expire(now + TIMEOUT), None);
        assert!(state.expire(now + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn explicit_release() {
        let mut state = DecodeState::new(DEFAULT_REPEAT_MAX, TIMEOUT);
        let now = Instant::now();

        state.decode(press("tv", "KEY_UP"), None, now);

        assert_eq!(state.release("tv", "KEY_DOWN"), None);
        assert!(state.release("tv", "KEY_UP").unwrap().release);
        assert_eq!(state.release("tv", "KEY_UP"), None);
    }
}

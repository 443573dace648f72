//! Capture engine states and status lines.

use serde::Serialize;
use std::fmt;

/// State of the capture engine.
///
/// Named states cover the normal cycle `STOP → ARM → PRE → POST → FIN1 → FIN2 → STOP`
/// plus `CLEANUP`, which is what a garbled or missing status reads as. Ids above the
/// named range are vendor sub-states and are carried opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AcqState {
    /// Id 0, or no usable status.
    Cleanup,
    /// Id 1. Idle.
    Stop,
    /// Id 2. Armed, waiting for trigger.
    Arm,
    /// Id 3. Capturing pre-trigger samples.
    Pre,
    /// Id 4. Capturing post-trigger samples.
    Post,
    /// Id 5. First finish stage.
    Fin1,
    /// Id 6. Second finish stage.
    Fin2,
    /// Any larger id.
    Vendor(u32),
}

impl AcqState {
    /// Map a numeric state id.
    pub fn from_id(id: u32) -> Self {
        match id {
            0 => AcqState::Cleanup,
            1 => AcqState::Stop,
            2 => AcqState::Arm,
            3 => AcqState::Pre,
            4 => AcqState::Post,
            5 => AcqState::Fin1,
            6 => AcqState::Fin2,
            other => AcqState::Vendor(other),
        }
    }

    /// Numeric id.
    pub fn id(self) -> u32 {
        match self {
            AcqState::Cleanup => 0,
            AcqState::Stop => 1,
            AcqState::Arm => 2,
            AcqState::Pre => 3,
            AcqState::Post => 4,
            AcqState::Fin1 => 5,
            AcqState::Fin2 => 6,
            AcqState::Vendor(id) => id,
        }
    }

    /// `STOP` or `CLEANUP`.
    pub fn is_idle(self) -> bool {
        matches!(self, AcqState::Stop | AcqState::Cleanup)
    }

    /// `ARM`, `PRE` or `POST`.
    pub fn is_capturing(self) -> bool {
        matches!(self, AcqState::Arm | AcqState::Pre | AcqState::Post)
    }
}

impl fmt::Display for AcqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcqState::Cleanup => write!(f, "CLEANUP"),
            AcqState::Stop => write!(f, "STOP"),
            AcqState::Arm => write!(f, "ARM"),
            AcqState::Pre => write!(f, "PRE"),
            AcqState::Post => write!(f, "POST"),
            AcqState::Fin1 => write!(f, "FIN1"),
            AcqState::Fin2 => write!(f, "FIN2"),
            AcqState::Vendor(id) => write!(f, "{}", id),
        }
    }
}

/// One status report: `"<id> <pre> <post> <elapsed> <reserved>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    /// Engine state.
    pub state: AcqState,
    /// Pre-trigger samples captured.
    pub pre: u64,
    /// Post-trigger samples captured.
    pub post: u64,
    /// Elapsed ticks.
    pub elapsed: u64,
    /// Reserved field.
    pub reserved: u64,
}

impl StateSnapshot {
    /// Parse a state-stream line. Malformed lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace().map(|f| f.parse::<u64>());
        let mut next = || fields.next().and_then(|f| f.ok());
        let id = next()?;
        let snapshot = Self {
            state: AcqState::from_id(u32::try_from(id).ok()?),
            pre: next()?,
            post: next()?,
            elapsed: next()?,
            reserved: next()?,
        };
        Some(snapshot)
    }

    /// Interpret the answer of the `state` knob.
    ///
    /// Missing counters read as zero; an empty or garbled answer reads as `CLEANUP`.
    pub fn from_status(text: &str) -> Self {
        let fields: Result<Vec<u64>, _> = text.split_whitespace().map(str::parse::<u64>).collect();
        match fields {
            Ok(fields) if !fields.is_empty() => {
                let at = |i: usize| fields.get(i).copied().unwrap_or(0);
                Self {
                    state: u32::try_from(fields[0])
                        .map(AcqState::from_id)
                        .unwrap_or(AcqState::Cleanup),
                    pre: at(1),
                    post: at(2),
                    elapsed: at(3),
                    reserved: at(4),
                }
            }
            _ => Self::cleanup(),
        }
    }

    /// Snapshot representing an unknown device state.
    pub fn cleanup() -> Self {
        Self {
            state: AcqState::Cleanup,
            pre: 0,
            post: 0,
            elapsed: 0,
            reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_state_line() {
        let snap = StateSnapshot::parse("2 0 0 0 0\n").unwrap();
        assert_eq!(snap.state, AcqState::Arm);
        assert_eq!((snap.pre, snap.post, snap.elapsed), (0, 0, 0));
    }

    #[test]
    fn carries_vendor_state_opaquely() {
        let snap = StateSnapshot::parse("7 100 200 5 0\n").unwrap();
        assert_eq!(snap.state, AcqState::Vendor(7));
        assert_eq!(snap.state.id(), 7);
        assert_eq!((snap.pre, snap.post, snap.elapsed), (100, 200, 5));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(StateSnapshot::parse("").is_none());
        assert!(StateSnapshot::parse("1 2 3").is_none());
        assert!(StateSnapshot::parse("ARM 0 0 0 0").is_none());
        assert!(StateSnapshot::parse("-1 0 0 0 0").is_none());
    }

    #[test]
    fn status_knob_falls_back_to_cleanup() {
        assert_eq!(StateSnapshot::from_status("").state, AcqState::Cleanup);
        assert_eq!(StateSnapshot::from_status("garbage").state, AcqState::Cleanup);
        let snap = StateSnapshot::from_status("4 0 1200");
        assert_eq!(snap.state, AcqState::Post);
        assert_eq!(snap.post, 1200);
        assert_eq!(snap.elapsed, 0);
    }

    #[test]
    fn idle_and_capturing_groups() {
        assert!(AcqState::Stop.is_idle());
        assert!(AcqState::Cleanup.is_idle());
        assert!(AcqState::Pre.is_capturing());
        assert!(!AcqState::Fin2.is_capturing());
        assert_eq!(AcqState::from_id(AcqState::Fin1.id()), AcqState::Fin1);
        assert_eq!(AcqState::Fin2.to_string(), "FIN2");
    }
}

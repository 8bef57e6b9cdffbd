//! One-shot capability negotiation that fixes `(id_bits, length_bits)` for
//! the life of a session.
//!
//! Uses the `shiftQuickInitRequest=29` bit layout with quick init fully
//! implemented. See `DESIGN.md` for the rationale.

use crate::{buffer::FeedableBuffer, error::Error};

pub const PROTOCOL_VERSION: u8 = 1;

const INIT_MESSAGE_LEN: usize = 5;
const RECOMMENDED_WILDCARD: u32 = 31;
const MAX_TOTAL_BITS: u32 = 30;

const SHIFT_QUICK_INIT_REQUEST: u32 = 29;
const SHIFT_QUICK_INIT_ALLOWED: u32 = 28;
const SHIFT_LENGTH_MIN: u32 = 24;
const SHIFT_LENGTH_MAX: u32 = 19;
const SHIFT_LENGTH_RECOMMENDED: u32 = 14;
const SHIFT_ID_MIN: u32 = 10;
const SHIFT_ID_MAX: u32 = 5;

const MASK_MIN: u32 = 0x0f;
const MASK_MAX: u32 = 0x1f;
const MASK_RECOMMENDED: u32 = 0x1f;

/// Per-axis (id or length) configuration this side brings to negotiation.
#[derive(Debug, Clone, Copy)]
pub struct AxisConfig {
    pub min: u32,
    pub max: u32,
    pub recommended: u32,
}

/// Full set of knobs passed to [`crate::Protocol::new`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub id: AxisConfig,
    pub length: AxisConfig,
    pub request_quick_init: bool,
    pub allow_quick_init: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotNegotiated,
    QuickNegotiated,
    FullyNegotiated,
    Failed,
}

pub(crate) struct Negotiator {
    config: Config,
    id_bits: u32,
    length_bits: u32,
    state: State,
    failure: Option<String>,
    incoming: FeedableBuffer,
}

impl Negotiator {
    pub(crate) fn new(config: Config) -> Result<Self, Error> {
        validate_initialize_fields(
            config.id.min,
            config.id.max,
            config.id.recommended,
            config.length.min,
            config.length.max,
            config.length.recommended,
            config.request_quick_init,
            config.allow_quick_init,
        )
        .map_err(Error::InvalidParameters)?;

        let state = if config.request_quick_init { State::QuickNegotiated } else { State::NotNegotiated };

        Ok(Self {
            config,
            id_bits: config.id.recommended,
            length_bits: config.length.recommended,
            state,
            failure: None,
            incoming: FeedableBuffer::new(0, INIT_MESSAGE_LEN),
        })
    }

    pub(crate) fn id_bits(&self) -> u32 {
        self.id_bits
    }

    pub(crate) fn length_bits(&self) -> u32 {
        self.length_bits
    }

    pub(crate) fn can_send(&self) -> bool {
        matches!(self.state, State::QuickNegotiated | State::FullyNegotiated)
    }

    pub(crate) fn can_receive(&self) -> bool {
        self.state == State::FullyNegotiated
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.state, State::FullyNegotiated | State::Failed)
    }

    pub(crate) fn explain_failure(&self) -> String {
        self.failure.clone().unwrap_or_else(|| "negotiation not complete".to_string())
    }

    pub(crate) fn build_initialize_message(&self) -> [u8; INIT_MESSAGE_LEN] {
        let pieces = self.id_bits
            | (self.config.id.max << SHIFT_ID_MAX)
            | (self.config.id.min << SHIFT_ID_MIN)
            | (self.length_bits << SHIFT_LENGTH_RECOMMENDED)
            | (self.config.length.max << SHIFT_LENGTH_MAX)
            | (self.config.length.min << SHIFT_LENGTH_MIN)
            | (u32::from(self.config.request_quick_init) << SHIFT_QUICK_INIT_REQUEST)
            | (u32::from(self.config.allow_quick_init) << SHIFT_QUICK_INIT_ALLOWED);

        [
            PROTOCOL_VERSION,
            (pieces >> 24) as u8,
            ((pieces >> 16) & 0xff) as u8,
            ((pieces >> 8) & 0xff) as u8,
            (pieces & 0xff) as u8,
        ]
    }

    /// Feeds bytes of the peer's 5-byte init frame. Returns whatever of
    /// `stream` wasn't needed. A negotiation failure is both returned to the
    /// caller and latched internally (further calls keep returning it).
    pub(crate) fn feed<'a>(&mut self, stream: &'a [u8]) -> Result<&'a [u8], Error> {
        if self.is_complete() {
            return Ok(stream);
        }

        let remaining = self.incoming.feed(stream);
        if !self.incoming.is_full() {
            return Ok(remaining);
        }

        match self.negotiate_initialize_message() {
            Ok(()) => {
                if self.state != State::Failed {
                    self.state = State::FullyNegotiated;
                }
                Ok(remaining)
            }
            Err(reason) => {
                self.state = State::Failed;
                self.failure = Some(reason.clone());
                tracing::warn!(%reason, "streamux negotiation failed");
                Err(Error::NegotiationFailed(reason))
            }
        }
    }

    fn negotiate_initialize_message(&mut self) -> Result<(), String> {
        let data = self.incoming.as_slice();
        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(format!("expected protocol version {PROTOCOL_VERSION}, got {version}"));
        }
        let message = u32::from(data[1]) << 24 | u32::from(data[2]) << 16 | u32::from(data[3]) << 8 | u32::from(data[4]);

        let them_id_rec = message & MASK_RECOMMENDED;
        let them_id_max = (message >> SHIFT_ID_MAX) & MASK_MAX;
        let them_id_min = (message >> SHIFT_ID_MIN) & MASK_MIN;
        let them_length_rec = (message >> SHIFT_LENGTH_RECOMMENDED) & MASK_RECOMMENDED;
        let them_length_max = (message >> SHIFT_LENGTH_MAX) & MASK_MAX;
        let them_length_min = (message >> SHIFT_LENGTH_MIN) & MASK_MIN;
        let them_request_quick = (message >> SHIFT_QUICK_INIT_REQUEST) & 1 == 1;
        let them_allow_quick = (message >> SHIFT_QUICK_INIT_ALLOWED) & 1 == 1;

        validate_initialize_fields(
            them_id_min,
            them_id_max,
            them_id_rec,
            them_length_min,
            them_length_max,
            them_length_rec,
            them_request_quick,
            them_allow_quick,
        )?;

        if self.config.request_quick_init {
            if !them_allow_quick {
                return Err("we requested quick init but peer doesn't allow it".to_string());
            }
            validate_min_max_recommend("ID", them_id_min, them_id_max, self.id_bits)?;
            validate_min_max_recommend("length", them_length_min, them_length_max, self.length_bits)?;
        } else if them_request_quick {
            if !self.config.allow_quick_init {
                return Err("peer requested quick init but we don't allow it".to_string());
            }
            validate_min_max_recommend("ID", self.config.id.min, self.config.id.max, them_id_rec)?;
            validate_min_max_recommend("length", self.config.length.min, self.config.length.max, them_length_rec)?;
            self.id_bits = them_id_rec;
            self.length_bits = them_length_rec;
        } else {
            let id_bits = negotiate_axis("ID", self.config.id, AxisConfig { min: them_id_min, max: them_id_max, recommended: them_id_rec })?;
            let length_bits = negotiate_axis(
                "length",
                self.config.length,
                AxisConfig { min: them_length_min, max: them_length_max, recommended: them_length_rec },
            )?;
            let (id_bits, length_bits) = cap_bit_counts(id_bits, length_bits);
            self.id_bits = id_bits;
            self.length_bits = length_bits;
        }

        Ok(())
    }
}

fn midpoint(min: u32, max: u32) -> u32 {
    let diff = max - min;
    let mut result = diff / 2 + min;
    if diff & 1 == 1 {
        result += 1;
    }
    result
}

fn negotiate_axis(name: &str, us: AxisConfig, them: AxisConfig) -> Result<u32, String> {
    let combined_min = us.min.max(them.min);
    let combined_max = us.max.min(them.max);
    if combined_max < combined_min {
        return Err(format!("{name}: max ({combined_max}) is less than min ({combined_min})"));
    }

    let mut recommended = us.recommended.min(them.recommended);
    if recommended == RECOMMENDED_WILDCARD {
        recommended = midpoint(combined_min, combined_max);
    }

    Ok(recommended.max(combined_min).min(combined_max))
}

fn cap_bit_counts(id_bits: u32, length_bits: u32) -> (u32, u32) {
    if length_bits + id_bits <= MAX_TOTAL_BITS {
        return (id_bits, length_bits);
    }
    let half = MAX_TOTAL_BITS / 2;
    if length_bits >= half {
        if id_bits >= half {
            (half, half)
        } else {
            (id_bits, MAX_TOTAL_BITS - id_bits)
        }
    } else {
        (MAX_TOTAL_BITS - length_bits, length_bits)
    }
}

fn validate_min_max_limits(name: &str, value: u32, min: u32, max: u32) -> Result<(), String> {
    if value < min {
        return Err(format!("{name} ({value}) is less than min ({min})"));
    }
    if value > max {
        return Err(format!("{name} ({value}) is greater than max ({max})"));
    }
    Ok(())
}

fn validate_min_max_field(name: &str, min: u32, max: u32) -> Result<(), String> {
    if min > max {
        return Err(format!("{name}: min ({min}) is greater than max ({max})"));
    }
    Ok(())
}

fn validate_min_max_recommend(name: &str, min: u32, max: u32, recommend: u32) -> Result<(), String> {
    if recommend == RECOMMENDED_WILDCARD {
        return Ok(());
    }
    if recommend < min {
        return Err(format!("recommended {name} ({recommend}) is less than min ({min})"));
    }
    if recommend > max {
        return Err(format!("recommended {name} ({recommend}) is greater than max ({max})"));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn validate_initialize_fields(
    id_min: u32,
    id_max: u32,
    id_rec: u32,
    length_min: u32,
    length_max: u32,
    length_rec: u32,
    request_quick_init: bool,
    allow_quick_init: bool,
) -> Result<(), String> {
    if request_quick_init {
        if allow_quick_init {
            return Err("cannot enable both quick init \"request\" and \"allow\" at the same time".to_string());
        }
        if length_rec == RECOMMENDED_WILDCARD {
            return Err(format!("cannot set recommended length bits to wildcard ({RECOMMENDED_WILDCARD}) when requesting quick init"));
        }
        if id_rec == RECOMMENDED_WILDCARD {
            return Err(format!("cannot set recommended ID bits to wildcard ({RECOMMENDED_WILDCARD}) when requesting quick init"));
        }
    }

    validate_min_max_limits("min length", length_min, 1, 15)?;
    validate_min_max_limits("max length", length_max, 1, 30)?;
    validate_min_max_field("length", length_min, length_max)?;
    validate_min_max_limits("recommended length", length_rec, 1, 31)?;
    validate_min_max_recommend("length", length_min, length_max, length_rec)?;

    validate_min_max_limits("min ID", id_min, 0, 15)?;
    validate_min_max_limits("max ID", id_max, 0, 29)?;
    validate_min_max_field("ID", id_min, id_max)?;
    validate_min_max_limits("recommended ID", id_rec, 0, 31)?;
    validate_min_max_recommend("ID", id_min, id_max, id_rec)?;

    Ok(())
}

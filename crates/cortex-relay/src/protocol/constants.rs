//! Protocol constants for method names, error codes, stream names, and the
//! EPOC X electrode layout.

/// Cortex API method names used by the negotiation flow.
pub struct Methods;

impl Methods {
    /// Request application access from the user.
    pub const REQUEST_ACCESS: &'static str = "requestAccess";

    /// Authorize and obtain a cortex token.
    pub const AUTHORIZE: &'static str = "authorize";

    /// Query available headsets.
    pub const QUERY_HEADSETS: &'static str = "queryHeadsets";

    /// Control (connect/disconnect) a specific headset.
    pub const CONTROL_DEVICE: &'static str = "controlDevice";

    /// Create a session (associates a headset with a cortex token).
    pub const CREATE_SESSION: &'static str = "createSession";

    /// Subscribe to data streams.
    pub const SUBSCRIBE: &'static str = "subscribe";

    /// Query existing sessions.
    pub const QUERY_SESSIONS: &'static str = "querySessions";
}

// ─── Error Codes ────────────────────────────────────────────────────────

/// Cortex API error codes the state machine routes recovery on.
pub struct ErrorCodes;

impl ErrorCodes {
    /// Headset unavailable — retry discovery.
    pub const HEADSET_UNAVAILABLE: i32 = -32004;

    /// Session already exists — query and reuse it.
    pub const SESSION_ALREADY_EXISTS: i32 = -32005;

    /// Session does not exist — full reset.
    pub const SESSION_NOT_FOUND: i32 = -32007;

    /// Invalid client credentials.
    pub const INVALID_CLIENT_CREDENTIALS: i32 = -32021;
}

// ─── Stream Names ───────────────────────────────────────────────────────

/// Cortex data stream names the relay subscribes to.
pub struct Streams;

impl Streams {
    /// Raw EEG channel data.
    pub const EEG: &'static str = "eeg";
    /// Device status: battery, signal, contact quality.
    pub const DEV: &'static str = "dev";
    /// EEG quality per sensor.
    pub const EQ: &'static str = "eq";

    /// All streams subscribed by the relay.
    pub const ALL: &'static [&'static str] = &[Self::EEG, Self::DEV, Self::EQ];
}

// ─── Electrode layout ───────────────────────────────────────────────────

/// EPOC X electrode names, always reported in this order.
pub const EPOC_X_CHANNELS: [&str; 14] = [
    "AF3", "F7", "F3", "FC5", "T7", "P7", "O1", "O2", "P8", "T8", "FC6", "F4", "F8", "AF4",
];

/// Occipital/parietal electrodes (P7, O1, O2, P8), indices into
/// [`EPOC_X_CHANNELS`]. These sit over the visual cortex and carry most of
/// the SSVEP response.
pub const SSVEP_CHANNEL_INDICES: [usize; 4] = [5, 6, 7, 8];

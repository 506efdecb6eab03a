//! Numeric stage taxonomy.
//!
//! Every content item moves through five phases (acquisition, validation,
//! processing, enhancement, finalization). Each phase owns a band of
//! integer codes; the integers are only the storage representation and are
//! converted at the ledger boundary with [`Stage::code`] and
//! [`Stage::from_code`].
//!
//! | Band | Phase |
//! |------|-------|
//! | 0–99 | System |
//! | 100–199 | Acquisition |
//! | 200–299 | Validation |
//! | 300–399 | Processing |
//! | 400–499 | Enhancement |
//! | 500–599 | Finalization (590, 595, 599 terminal) |
//! | 666, 777, 888 | Control codes |
//!
//! Control codes live outside the linear ordering. The only ordering the
//! ledger relies on is "most recent record wins".

use std::cmp::Ordering;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::AtlasError;

macro_rules! phase_stages {
    ($(#[$meta:meta])* $name:ident {
        $($(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal),+ $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(self) -> u16 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

phase_stages! {
    /// Bookkeeping stages written before an item enters the pipeline.
    SystemStage {
        Initialized = 0 => "initialized",
        Registered = 10 => "registered",
    }
}

phase_stages! {
    AcquisitionStage {
        ContentReceived = 100 => "content_received",
        ContentQueued = 110 => "content_queued",
        FetchStarted = 120 => "fetch_started",
        Acquired = 150 => "acquired",
        AcquisitionFailed = 199 => "acquisition_failed",
    }
}

phase_stages! {
    ValidationStage {
        ValidationStarted = 200 => "validation_started",
        DuplicateChecked = 220 => "duplicate_checked",
        Validated = 250 => "validated",
        ValidationFailed = 299 => "validation_failed",
    }
}

phase_stages! {
    ProcessingStage {
        ProcessingStarted = 300 => "processing_started",
        Processed = 350 => "processed",
        ProcessingFailed = 399 => "processing_failed",
    }
}

phase_stages! {
    EnhancementStage {
        EnhancementStarted = 400 => "enhancement_started",
        Enhanced = 450 => "enhanced",
        EnhancementFailed = 499 => "enhancement_failed",
    }
}

phase_stages! {
    FinalizationStage {
        FinalizationStarted = 500 => "finalization_started",
        Indexed = 550 => "indexed",
        Completed = 590 => "completed",
        Archived = 595 => "archived",
        /// Duplicate of an item that already reached a terminal stage.
        Duplicate = 599 => "duplicate",
    }
}

phase_stages! {
    /// Out-of-band codes. A scheduler may re-drive `RateLimited` items.
    ControlCode {
        RateLimited = 666 => "rate_limited",
        PermanentError = 777 => "permanent_error",
        SystemError = 888 => "system_error",
    }
}

/// The pipeline phase owning a band of stage codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    System,
    Acquisition,
    Validation,
    Processing,
    Enhancement,
    Finalization,
    Control,
}

impl Phase {
    /// The full code band of this phase.
    pub fn band(self) -> RangeInclusive<u16> {
        match self {
            Phase::System => 0..=99,
            Phase::Acquisition => 100..=199,
            Phase::Validation => 200..=299,
            Phase::Processing => 300..=399,
            Phase::Enhancement => 400..=499,
            Phase::Finalization => 500..=599,
            Phase::Control => 600..=999,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::System => "system",
            Phase::Acquisition => "acquisition",
            Phase::Validation => "validation",
            Phase::Processing => "processing",
            Phase::Enhancement => "enhancement",
            Phase::Finalization => "finalization",
            Phase::Control => "control",
        }
    }
}

/// A content item's position in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    System(SystemStage),
    Acquisition(AcquisitionStage),
    Validation(ValidationStage),
    Processing(ProcessingStage),
    Enhancement(EnhancementStage),
    Finalization(FinalizationStage),
    Control(ControlCode),
}

impl Stage {
    pub const INITIALIZED: Stage = Stage::System(SystemStage::Initialized);
    pub const CONTENT_RECEIVED: Stage = Stage::Acquisition(AcquisitionStage::ContentReceived);
    pub const CONTENT_QUEUED: Stage = Stage::Acquisition(AcquisitionStage::ContentQueued);
    pub const ACQUIRED: Stage = Stage::Acquisition(AcquisitionStage::Acquired);
    pub const ACQUISITION_FAILED: Stage = Stage::Acquisition(AcquisitionStage::AcquisitionFailed);
    pub const VALIDATION_STARTED: Stage = Stage::Validation(ValidationStage::ValidationStarted);
    pub const VALIDATED: Stage = Stage::Validation(ValidationStage::Validated);
    pub const VALIDATION_FAILED: Stage = Stage::Validation(ValidationStage::ValidationFailed);
    pub const PROCESSING_STARTED: Stage = Stage::Processing(ProcessingStage::ProcessingStarted);
    pub const PROCESSED: Stage = Stage::Processing(ProcessingStage::Processed);
    pub const PROCESSING_FAILED: Stage = Stage::Processing(ProcessingStage::ProcessingFailed);
    pub const ENHANCEMENT_STARTED: Stage = Stage::Enhancement(EnhancementStage::EnhancementStarted);
    pub const ENHANCED: Stage = Stage::Enhancement(EnhancementStage::Enhanced);
    pub const ENHANCEMENT_FAILED: Stage = Stage::Enhancement(EnhancementStage::EnhancementFailed);
    pub const FINALIZATION_STARTED: Stage =
        Stage::Finalization(FinalizationStage::FinalizationStarted);
    pub const INDEXED: Stage = Stage::Finalization(FinalizationStage::Indexed);
    pub const COMPLETED: Stage = Stage::Finalization(FinalizationStage::Completed);
    pub const ARCHIVED: Stage = Stage::Finalization(FinalizationStage::Archived);
    pub const DUPLICATE: Stage = Stage::Finalization(FinalizationStage::Duplicate);
    pub const RATE_LIMITED: Stage = Stage::Control(ControlCode::RateLimited);
    pub const PERMANENT_ERROR: Stage = Stage::Control(ControlCode::PermanentError);
    pub const SYSTEM_ERROR: Stage = Stage::Control(ControlCode::SystemError);

    pub fn code(self) -> u16 {
        match self {
            Stage::System(s) => s.code(),
            Stage::Acquisition(s) => s.code(),
            Stage::Validation(s) => s.code(),
            Stage::Processing(s) => s.code(),
            Stage::Enhancement(s) => s.code(),
            Stage::Finalization(s) => s.code(),
            Stage::Control(s) => s.code(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::System(s) => s.label(),
            Stage::Acquisition(s) => s.label(),
            Stage::Validation(s) => s.label(),
            Stage::Processing(s) => s.label(),
            Stage::Enhancement(s) => s.label(),
            Stage::Finalization(s) => s.label(),
            Stage::Control(s) => s.label(),
        }
    }

    pub fn phase(self) -> Phase {
        match self {
            Stage::System(_) => Phase::System,
            Stage::Acquisition(_) => Phase::Acquisition,
            Stage::Validation(_) => Phase::Validation,
            Stage::Processing(_) => Phase::Processing,
            Stage::Enhancement(_) => Phase::Enhancement,
            Stage::Finalization(_) => Phase::Finalization,
            Stage::Control(_) => Phase::Control,
        }
    }

    /// Convert a stored integer back into a stage.
    pub fn from_code(code: i64) -> Result<Stage, AtlasError> {
        let unknown = || AtlasError::UnknownStage(code);
        let c = u16::try_from(code).map_err(|_| unknown())?;
        let stage = match c {
            0..=99 => SystemStage::from_code(c).map(Stage::System),
            100..=199 => AcquisitionStage::from_code(c).map(Stage::Acquisition),
            200..=299 => ValidationStage::from_code(c).map(Stage::Validation),
            300..=399 => ProcessingStage::from_code(c).map(Stage::Processing),
            400..=499 => EnhancementStage::from_code(c).map(Stage::Enhancement),
            500..=599 => FinalizationStage::from_code(c).map(Stage::Finalization),
            _ => ControlCode::from_code(c).map(Stage::Control),
        };
        stage.ok_or_else(unknown)
    }

    /// Completed, archived, or duplicate. No handler runs on these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Stage::Finalization(
                FinalizationStage::Completed
                    | FinalizationStage::Archived
                    | FinalizationStage::Duplicate
            )
        )
    }

    pub fn is_control(self) -> bool {
        matches!(self, Stage::Control(_))
    }

    /// Explicit per-phase failure stages plus the error control codes.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Stage::Acquisition(AcquisitionStage::AcquisitionFailed)
                | Stage::Validation(ValidationStage::ValidationFailed)
                | Stage::Processing(ProcessingStage::ProcessingFailed)
                | Stage::Enhancement(EnhancementStage::EnhancementFailed)
                | Stage::Control(ControlCode::PermanentError | ControlCode::SystemError)
        )
    }

    /// Every named stage in code order.
    pub fn all() -> Vec<Stage> {
        let mut all: Vec<Stage> = SystemStage::ALL
            .iter()
            .map(|s| Stage::System(*s))
            .chain(AcquisitionStage::ALL.iter().map(|s| Stage::Acquisition(*s)))
            .chain(ValidationStage::ALL.iter().map(|s| Stage::Validation(*s)))
            .chain(ProcessingStage::ALL.iter().map(|s| Stage::Processing(*s)))
            .chain(EnhancementStage::ALL.iter().map(|s| Stage::Enhancement(*s)))
            .chain(FinalizationStage::ALL.iter().map(|s| Stage::Finalization(*s)))
            .chain(ControlCode::ALL.iter().map(|s| Stage::Control(*s)))
            .collect();
        all.sort();
        all
    }
}

impl Ord for Stage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.code().cmp(&other.code())
    }
}

impl PartialOrd for Stage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.label())
    }
}

/// Stages serialize as their numeric code, the same form the ledger stores.
impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

/// Accepts either the numeric code (`"110"`) or the label (`"content_queued"`).
impl FromStr for Stage {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<i64>() {
            return Stage::from_code(code);
        }
        Stage::all()
            .into_iter()
            .find(|stage| stage.label().eq_ignore_ascii_case(s))
            .ok_or(AtlasError::UnknownStage(-1))
    }
}

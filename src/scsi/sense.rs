//! Sense interpreter (C2).
//!
//! Maps `(device identity, device type, sense key, ASC, ASCQ)` to one of a
//! small, closed action set. Grounded in the per-call sense matching
//! scattered through the SCSI transport layer (each `match` against a
//! `SenseInfo { sense_key, asc, ascq }` triple), pulled out into one
//! table-driven lookup so every caller shares identical recovery logic.

use std::collections::HashMap;

use super::sgutils2::SenseInfo;

/// Device type discriminator used as part of the lookup key; kept
/// separate from `DeviceIdent` so wildcard matches on the identity
/// string still distinguish tape drives from changers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Tape,
    Changer,
}

/// Action returned by the sense interpreter. Closed set; an unknown
/// triple always maps to `Abort`, never to silent success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseAction {
    /// No action required, sense is informational.
    No,
    /// Transient condition, caller should retry the command.
    Retry,
    /// Unrecoverable for this call; abort.
    Abort,
    /// No action, sense explicitly ignored (e.g. vendor-specific chatter).
    Ignore,
    /// Request INITIALIZE ELEMENT STATUS and retry.
    Ies,
    /// Tape/element is not online.
    TapeNotOnline,
    /// Tape/element has not been unloaded.
    TapeNotUnloaded,
    /// Element status changed, caller should refresh and retry.
    ChgElementStatus,
}

const WILDCARD: &str = "*";

/// Identifies a device for sense lookup purposes: the SCSI INQUIRY
/// product string, or `"*"` for the generic fallback entries.
pub type DeviceIdent<'a> = &'a str;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    asc: u8,
    ascq: u8,
}

struct SenseTable {
    // (device, kind) -> (asc, ascq) -> action
    by_device: HashMap<(&'static str, DeviceKind), HashMap<Key, SenseAction>>,
    // asc -> action, used as the (asc, '*') wildcard fallback
    by_asc: HashMap<u8, SenseAction>,
}

fn build_table() -> SenseTable {
    let mut by_device: HashMap<(&'static str, DeviceKind), HashMap<Key, SenseAction>> =
        HashMap::new();

    // Generic entries, shared by every device identity via the
    // (WILDCARD, kind) fallback.
    let mut generic_tape = HashMap::new();
    generic_tape.insert(Key { asc: 0x00, ascq: 0x00 }, SenseAction::No);
    // Not ready -> in process of becoming ready
    generic_tape.insert(Key { asc: 0x04, ascq: 0x01 }, SenseAction::Retry);
    // Not ready -> initializing command required
    generic_tape.insert(Key { asc: 0x04, ascq: 0x02 }, SenseAction::Retry);
    // No medium present
    generic_tape.insert(Key { asc: 0x3a, ascq: 0x00 }, SenseAction::TapeNotOnline);
    // Medium removal prevented (tape not unloaded)
    generic_tape.insert(Key { asc: 0x53, ascq: 0x00 }, SenseAction::TapeNotUnloaded);
    // Unit attention: power on, reset, or bus device reset occurred
    generic_tape.insert(Key { asc: 0x29, ascq: 0x00 }, SenseAction::Retry);
    by_device.insert((WILDCARD, DeviceKind::Tape), generic_tape);

    let mut generic_changer = HashMap::new();
    generic_changer.insert(Key { asc: 0x00, ascq: 0x00 }, SenseAction::No);
    // Not ready to ready transition (element status changed)
    generic_changer.insert(Key { asc: 0x28, ascq: 0x00 }, SenseAction::Ies);
    generic_changer.insert(Key { asc: 0x29, ascq: 0x00 }, SenseAction::Retry);
    // Mechanical positioning error
    generic_changer.insert(Key { asc: 0x15, ascq: 0x01 }, SenseAction::ChgElementStatus);
    by_device.insert((WILDCARD, DeviceKind::Changer), generic_changer);

    let mut by_asc = HashMap::new();
    by_asc.insert(0x04, SenseAction::Retry);
    by_asc.insert(0x29, SenseAction::Retry);
    by_asc.insert(0x28, SenseAction::Ies);

    SenseTable { by_device, by_asc }
}

lazy_static::lazy_static! {
    static ref TABLE: SenseTable = build_table();
}

/// Look up the action for a sense triple observed on a device of the
/// given identity and kind.
///
/// Lookup order (§4.2): `(device, asc, ascq)`, then `(*, asc, ascq)`,
/// then `(asc, *)`. An unmatched triple is `Abort`.
///
/// No product identity currently has an entry of its own in
/// [`build_table`]: the source this is grounded on (`scsi-changer-driver.c`'s
/// `ChangerIO` table) registers every quirk, including the ones with a
/// bespoke `move`/`element_status` function, against the same shared
/// `GenericSenseHandler` — sense interpretation itself is never
/// overridden per product. The `(ident, kind)` lookup below is real and
/// runs first, so a future quirk that does need its own sense table
/// only has to add a `by_device` entry keyed on its product prefix.
pub fn interpret(ident: DeviceIdent<'_>, kind: DeviceKind, sense: &SenseInfo) -> SenseAction {
    let key = Key {
        asc: sense.asc,
        ascq: sense.ascq,
    };

    if sense.sense_key == 0x00 {
        return SenseAction::No;
    }

    if ident != WILDCARD {
        if let Some((_, table)) = TABLE
            .by_device
            .iter()
            .find(|entry| entry.0 .0 == ident && entry.0 .1 == kind)
        {
            if let Some(action) = table.get(&key) {
                return *action;
            }
        }
    }

    if let Some(table) = TABLE.by_device.get(&(WILDCARD, kind)) {
        if let Some(action) = table.get(&key) {
            return *action;
        }
    }

    if let Some(action) = TABLE.by_asc.get(&sense.asc) {
        return *action;
    }

    SenseAction::Abort
}

//! Changer quirk dispatch (§4.8 "Driver selection").
//!
//! INQUIRY's product-id string is matched against a table of
//! product-id prefixes; the matching entry supplies the handful of
//! behaviours that differ across real hardware. Unknown products fall
//! back to a generic entry keyed by `generic_<peripheral-type>`, which
//! is exactly [`GenericQuirk`].
//!
//! This is the open registry the design notes call for: a trait object
//! per model rather than a closed enum, since new vendors are added
//! without touching the driver itself.

/// What, if anything, a quirk wants the driver to do before issuing
/// MOVE MEDIUM (§4.8, SDX variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreMoveAction {
    /// No special handling.
    None,
    /// Source is a DTE with a loaded tape: eject it first.
    EjectLoadedSource,
}

/// Hardware-specific behaviour a changer driver consults. Every method
/// has a sane generic default; a quirk overrides only what its
/// hardware needs.
pub trait ChangerQuirk: Send + Sync {
    /// Name used in log messages and the quirk-table key.
    fn name(&self) -> &'static str;

    /// Extra bytes to skip after the MODE SENSE(0x1A) page-0x3F header
    /// before the Element Address Assignment page proper (§4.8 step 1:
    /// "ADIC DLT 448 requires a +12-byte header skip").
    fn mode_sense_header_skip(&self) -> usize {
        0
    }

    /// Hook consulted by `GenericMove` before the actual MOVE MEDIUM
    /// (§4.8): the SDX variant issues a vendor `SCSI_AlignElements`
    /// naming the (MTE, DTE, STE) triple and, if the source is a DTE
    /// with a loaded tape, ejects first.
    fn pre_move(&self, source_is_loaded_dte: bool) -> PreMoveAction {
        let _ = source_is_loaded_dte;
        PreMoveAction::None
    }

    /// Whether this quirk issues its own vendor align command before
    /// MOVE MEDIUM (SDX's `SCSI_AlignElements`, opcode 0xE5).
    fn uses_vendor_align(&self) -> bool {
        false
    }
}

/// The fallback quirk used for any product-id without a specific
/// entry, keyed as `generic_<peripheral-type>` (§4.8).
pub struct GenericQuirk {
    key: String,
}

impl GenericQuirk {
    fn for_peripheral_type(peripheral_type: u8) -> Self {
        Self {
            key: format!("generic_{peripheral_type}"),
        }
    }
}

impl ChangerQuirk for GenericQuirk {
    fn name(&self) -> &'static str {
        // leaked once per process; there are only a handful of
        // peripheral types so this never grows unbounded.
        Box::leak(self.key.clone().into_boxed_str())
    }
}

/// ADIC DLT 448 library: needs an extra 12 bytes skipped after the
/// mode-sense page-0x3F header before the address-assignment page.
struct AdicDlt448Quirk;

impl ChangerQuirk for AdicDlt448Quirk {
    fn name(&self) -> &'static str {
        "ADIC DLT 448"
    }

    fn mode_sense_header_skip(&self) -> usize {
        12
    }
}

/// Spectra Logic "SDX" libraries: align elements before a move and
/// eject a loaded drive before sourcing it.
struct SdxQuirk;

impl ChangerQuirk for SdxQuirk {
    fn name(&self) -> &'static str {
        "SDX"
    }

    fn pre_move(&self, source_is_loaded_dte: bool) -> PreMoveAction {
        if source_is_loaded_dte {
            PreMoveAction::EjectLoadedSource
        } else {
            PreMoveAction::None
        }
    }

    fn uses_vendor_align(&self) -> bool {
        true
    }
}

/// Product-id prefix table, checked in order; first match wins.
const QUIRK_TABLE: &[(&str, fn() -> Box<dyn ChangerQuirk>)] = &[
    ("ADIC DLT 448", || Box::new(AdicDlt448Quirk)),
    ("SDX", || Box::new(SdxQuirk)),
];

/// Select a quirk for the given INQUIRY product-id string, falling
/// back to [`GenericQuirk`] keyed on `peripheral_type` if nothing
/// matches (§4.8).
pub fn quirk_for_product(product_id: &str, peripheral_type: u8) -> Box<dyn ChangerQuirk> {
    let product_id = product_id.trim();
    for (prefix, make) in QUIRK_TABLE {
        if product_id.starts_with(prefix) {
            return make();
        }
    }
    Box::new(GenericQuirk::for_peripheral_type(peripheral_type))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_product_falls_back_to_generic() {
        let quirk = quirk_for_product("Some Weird Library", 8);
        assert_eq!(quirk.name(), "generic_8");
        assert_eq!(quirk.mode_sense_header_skip(), 0);
    }

    #[test]
    fn adic_dlt_448_skips_header() {
        let quirk = quirk_for_product("ADIC DLT 448 rev 1", 8);
        assert_eq!(quirk.mode_sense_header_skip(), 12);
    }

    #[test]
    fn sdx_ejects_loaded_source() {
        let quirk = quirk_for_product("SDX-100", 8);
        assert!(quirk.uses_vendor_align());
        assert_eq!(
            quirk.pre_move(true),
            PreMoveAction::EjectLoadedSource
        );
        assert_eq!(quirk.pre_move(false), PreMoveAction::None);
    }
}

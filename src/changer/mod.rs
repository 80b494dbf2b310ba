//! Medium-changer element model and driver (C8, C9).
//!
//! [`sgutils`] talks raw SCSI to a changer device and decodes its
//! READ ELEMENT STATUS replies into the typed element arrays defined
//! here; [`driver`] builds the move/inventory/load-unload algorithms
//! on top, dispatching hardware-specific behaviour through the quirk
//! table in [`quirk`].

pub mod driver;
pub mod quirk;
pub mod sgutils;

/// Element type, per §3.3: the four SCSI medium-changer element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Medium transport element (the robot/gripper).
    Mte,
    /// Storage element (a storage slot).
    Ste,
    /// Import/export element (a mail slot).
    Iee,
    /// Data transfer element (a drive).
    Dte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Empty,
    Full,
}

/// One element of an [`ElementKind`] array.
///
/// `source_address` is `-1` when unknown/invalid, matching the
/// original's sentinel convention. `volume_tag` holds up to 36
/// characters (§3.6's `SCSI_VOLUME_TAG_LEN` on the wire).
#[derive(Debug, Clone)]
pub struct Element {
    pub kind: ElementKind,
    pub address: u16,
    pub occupancy: Occupancy,
    pub except: bool,
    pub asc: u8,
    pub ascq: u8,
    pub source_address: i32,
    pub volume_tag: Option<String>,
    /// Drive-only: vendor/model/serial, when the changer reports DVCID.
    pub drive_ident: Option<DriveIdent>,
}

#[derive(Debug, Clone, Default)]
pub struct DriveIdent {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

impl Element {
    fn new(kind: ElementKind, address: u16) -> Self {
        Self {
            kind,
            address,
            occupancy: Occupancy::Empty,
            except: false,
            asc: 0,
            ascq: 0,
            source_address: -1,
            volume_tag: None,
            drive_ident: None,
        }
    }
}

/// The four dynamic element arrays owned by the driver, keyed by type
/// (§3.3). Array indices are element-ordinal; `address` fields are the
/// opaque SCSI element addresses.
#[derive(Debug, Clone, Default)]
pub struct ElementTable {
    pub transports: Vec<Element>,
    pub storage: Vec<Element>,
    pub import_export: Vec<Element>,
    pub transfer: Vec<Element>,
}

impl ElementTable {
    /// Address of the (first) medium transport element, used as the
    /// `medium_transport_address` field of MOVE MEDIUM.
    pub fn transport_address(&self) -> Result<u16, crate::error::DeviceError> {
        self.transports
            .first()
            .map(|e| e.address)
            .ok_or_else(|| crate::error::DeviceError::NotFound("no transport element".into()))
    }

    /// 1-based virtual slot address, covering storage slots first then
    /// import/export slots, matching mtx(1) ordering.
    pub fn slot_address(&self, slot: u64) -> Result<u16, crate::error::DeviceError> {
        let idx = slot.checked_sub(1).ok_or_else(|| {
            crate::error::DeviceError::InvalidArg("slot numbers are 1-based".into())
        })? as usize;
        if idx < self.storage.len() {
            return Ok(self.storage[idx].address);
        }
        let idx = idx - self.storage.len();
        self.import_export
            .get(idx)
            .map(|e| e.address)
            .ok_or_else(|| crate::error::DeviceError::NotFound(format!("slot {slot} out of range")))
    }

    pub fn drive_address(&self, drivenum: u64) -> Result<u16, crate::error::DeviceError> {
        self.transfer
            .get(drivenum as usize)
            .map(|e| e.address)
            .ok_or_else(|| crate::error::DeviceError::NotFound(format!("drive {drivenum} out of range")))
    }

    /// Find the first empty storage slot, used by `GenericMove`'s
    /// fallback when source/destination clash.
    pub fn first_empty_storage(&self) -> Option<&Element> {
        self.storage.iter().find(|e| e.occupancy == Occupancy::Empty)
    }

    pub fn drive_mut(&mut self, drivenum: u64) -> Option<&mut Element> {
        self.transfer.get_mut(drivenum as usize)
    }

    pub fn find_by_address_mut(&mut self, address: u16) -> Option<&mut Element> {
        self.transports
            .iter_mut()
            .chain(self.storage.iter_mut())
            .chain(self.import_export.iter_mut())
            .chain(self.transfer.iter_mut())
            .find(|e| e.address == address)
    }
}

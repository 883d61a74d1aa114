//! G3 MAC-RT information base: attribute identifiers, the PIB access object
//! and the host-side MIB snapshot used to repair the modem after a reset.

/// Largest MAC-RT PIB value (sized for the neighbour/POS table entries).
pub const MAC_RT_PIB_MAX_VALUE_LENGTH: usize = 144;

/// Serialized size of [`MibBackup`], the payload of
/// [`MacRtPib::GetSetAllMib`].
pub const MIB_BACKUP_SIZE: usize = 33;

/// MAC-RT PIB attributes the PAL deals with. The modem knows many more;
/// unknown ones pass through untouched (and unmirrored).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacRtPib {
    AckWaitDuration,
    MinBe,
    MaxBe,
    MaxCsmaBackoffs,
    MaxFrameRetries,
    PanId,
    ShortAddress,
    ExtendedAddress,
    PromiscuousMode,
    ToneMask,
    HighPriorityWindowSize,
    RcCoord,
    BroadcastMaxCwEnable,
    TransmitAtten,
    PosTableEntryTtl,
    /// Whole [`MibBackup`] snapshot in one access.
    GetSetAllMib,
    /// PHY layer parameter, selected by the object index (coupling values,
    /// impedance configuration).
    ManufPhyParam,
}

/// Result codes shared by the PIB access paths and TX confirmations,
/// mirroring the modem firmware's status set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacRtStatus {
    Success,
    ChannelAccessFailure,
    NoAck,
    Denied,
    InvalidIndex,
    InvalidParameter,
    LimitReached,
    NoData,
    ReadOnly,
    TransactionOverflow,
    UnsupportedAttribute,
}

/// One PIB access: attribute, table index and a raw value buffer sized to
/// the largest attribute.
#[derive(Clone)]
pub struct MacRtPibObj {
    pub pib: MacRtPib,
    pub index: u16,
    pub length: u8,
    pub data: [u8; MAC_RT_PIB_MAX_VALUE_LENGTH],
}

impl MacRtPibObj {
    pub fn new(pib: MacRtPib, index: u16, value: &[u8]) -> Self {
        let mut data = [0; MAC_RT_PIB_MAX_VALUE_LENGTH];
        data[..value.len()].copy_from_slice(value);
        Self {
            pib,
            index,
            length: value.len() as u8,
            data,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

/// Host-side mirror of the modem's writable MIB. Every successful PIB write
/// updates the matching field, so a chip reset can be repaired by pushing
/// the whole snapshot back without the upper layer re-issuing anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MibBackup {
    pub pan_id: u16,
    pub short_address: u16,
    pub extended_address: [u8; 8],
    pub tone_mask: [u8; 9],
    pub min_be: u8,
    pub max_be: u8,
    pub max_csma_backoffs: u8,
    pub max_frame_retries: u8,
    pub high_priority_window_size: u8,
    pub rc_coord: u16,
    pub promiscuous_mode: bool,
    pub broadcast_max_cw_enable: bool,
    pub coordinator: bool,
    pub transmit_atten: u8,
    pub pos_table_entry_ttl: u8,
}

impl Default for MibBackup {
    fn default() -> Self {
        Self {
            pan_id: 0xFFFF,
            short_address: 0xFFFF,
            extended_address: [0; 8],
            tone_mask: [0xFF; 9],
            min_be: 3,
            max_be: 8,
            max_csma_backoffs: 5,
            max_frame_retries: 5,
            high_priority_window_size: 7,
            rc_coord: 0xFFFF,
            promiscuous_mode: false,
            broadcast_max_cw_enable: false,
            coordinator: false,
            transmit_atten: 0,
            pos_table_entry_ttl: 255,
        }
    }
}

impl MibBackup {
    /// Mirror one successful PIB write. Attributes outside the snapshot are
    /// ignored.
    pub fn update(&mut self, obj: &MacRtPibObj) {
        let d = &obj.data;
        match obj.pib {
            MacRtPib::PanId => self.pan_id = u16::from_le_bytes([d[0], d[1]]),
            MacRtPib::ShortAddress => self.short_address = u16::from_le_bytes([d[0], d[1]]),
            MacRtPib::ExtendedAddress => self.extended_address.copy_from_slice(&d[..8]),
            MacRtPib::ToneMask => self.tone_mask.copy_from_slice(&d[..9]),
            MacRtPib::MinBe => self.min_be = d[0],
            MacRtPib::MaxBe => self.max_be = d[0],
            MacRtPib::MaxCsmaBackoffs => self.max_csma_backoffs = d[0],
            MacRtPib::MaxFrameRetries => self.max_frame_retries = d[0],
            MacRtPib::HighPriorityWindowSize => self.high_priority_window_size = d[0],
            MacRtPib::RcCoord => self.rc_coord = u16::from_le_bytes([d[0], d[1]]),
            MacRtPib::PromiscuousMode => self.promiscuous_mode = d[0] != 0,
            MacRtPib::BroadcastMaxCwEnable => self.broadcast_max_cw_enable = d[0] != 0,
            MacRtPib::TransmitAtten => self.transmit_atten = d[0],
            MacRtPib::PosTableEntryTtl => self.pos_table_entry_ttl = d[0],
            MacRtPib::GetSetAllMib => *self = Self::from_bytes(&d[..MIB_BACKUP_SIZE]),
            MacRtPib::AckWaitDuration | MacRtPib::ManufPhyParam => {}
        }
    }

    pub fn to_bytes(&self) -> [u8; MIB_BACKUP_SIZE] {
        let mut out = [0u8; MIB_BACKUP_SIZE];
        out[0..2].copy_from_slice(&self.pan_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.short_address.to_le_bytes());
        out[4..12].copy_from_slice(&self.extended_address);
        out[12..21].copy_from_slice(&self.tone_mask);
        out[21] = self.min_be;
        out[22] = self.max_be;
        out[23] = self.max_csma_backoffs;
        out[24] = self.max_frame_retries;
        out[25] = self.high_priority_window_size;
        out[26..28].copy_from_slice(&self.rc_coord.to_le_bytes());
        out[28] = self.promiscuous_mode as u8;
        out[29] = self.broadcast_max_cw_enable as u8;
        out[30] = self.coordinator as u8;
        out[31] = self.transmit_atten;
        out[32] = self.pos_table_entry_ttl;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() < MIB_BACKUP_SIZE {
            return Self::default();
        }
        let mut extended_address = [0u8; 8];
        extended_address.copy_from_slice(&bytes[4..12]);
        let mut tone_mask = [0u8; 9];
        tone_mask.copy_from_slice(&bytes[12..21]);
        Self {
            pan_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            short_address: u16::from_le_bytes([bytes[2], bytes[3]]),
            extended_address,
            tone_mask,
            min_be: bytes[21],
            max_be: bytes[22],
            max_csma_backoffs: bytes[23],
            max_frame_retries: bytes[24],
            high_priority_window_size: bytes[25],
            rc_coord: u16::from_le_bytes([bytes[26], bytes[27]]),
            promiscuous_mode: bytes[28] != 0,
            broadcast_max_cw_enable: bytes[29] != 0,
            coordinator: bytes[30] != 0,
            transmit_atten: bytes[31],
            pos_table_entry_ttl: bytes[32],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_mirrors_writes() {
        let mut mib = MibBackup::default();
        mib.update(&MacRtPibObj::new(MacRtPib::PanId, 0, &0x1234u16.to_le_bytes()));
        mib.update(&MacRtPibObj::new(MacRtPib::ShortAddress, 0, &0x0002u16.to_le_bytes()));
        mib.update(&MacRtPibObj::new(MacRtPib::MaxFrameRetries, 0, &[7]));
        mib.update(&MacRtPibObj::new(MacRtPib::PromiscuousMode, 0, &[1]));
        assert_eq!(mib.pan_id, 0x1234);
        assert_eq!(mib.short_address, 2);
        assert_eq!(mib.max_frame_retries, 7);
        assert!(mib.promiscuous_mode);

        // Not part of the snapshot.
        let before = mib.clone();
        mib.update(&MacRtPibObj::new(MacRtPib::ManufPhyParam, 0x0A, &[2]));
        assert_eq!(mib, before);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut mib = MibBackup::default();
        mib.pan_id = 0x781D;
        mib.short_address = 0x0001;
        mib.extended_address = [1, 2, 3, 4, 5, 6, 7, 8];
        mib.tone_mask[0] = 0x3F;
        mib.rc_coord = 0x0123;
        mib.coordinator = true;

        let restored = MibBackup::from_bytes(&mib.to_bytes());
        assert_eq!(restored, mib);
    }

    #[test]
    fn truncated_snapshot_falls_back_to_defaults() {
        assert_eq!(MibBackup::from_bytes(&[0u8; 4]), MibBackup::default());
    }

    #[test]
    fn full_snapshot_write_replaces_state() {
        let mut donor = MibBackup::default();
        donor.pan_id = 0x4242;
        let obj = MacRtPibObj::new(MacRtPib::GetSetAllMib, 0, &donor.to_bytes());

        let mut mib = MibBackup::default();
        mib.update(&obj);
        assert_eq!(mib, donor);
    }
}

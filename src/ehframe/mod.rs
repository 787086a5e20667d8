//! `.eh_frame` record framing (CIE/FDE), the FDE liveness hook, and the
//! `.eh_frame_hdr` binary-search table

use crate::base::IoCtx;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What one framed record is
pub enum EhRecordKind {
    /// A Common Information Entry (id field is zero)
    Cie,
    /// A Frame Description Entry pointing back at its CIE
    Fde {
        /// Section offset of the CIE this FDE references
        cie_offset: u64,
    },
    /// The zero-length terminator record
    Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One record carved out of an input `.eh_frame` section
pub struct EhFrameRecord {
    /// Offset of the record (its length word) inside the section
    pub offset: u64,
    /// Total size including the length word
    pub size: u64,
    /// CIE, FDE, or terminator
    pub kind: EhRecordKind,
}

impl EhFrameRecord {
    /// Section offset of an FDE's pc-begin field; the relocation landing
    /// there decides the FDE's liveness
    pub fn pc_begin_offset(&self) -> u64 {
        self.offset + 8
    }
}

/// Frame the records of an input `.eh_frame` section. The CFI framing:
/// a 4-byte length (0xffffffff would introduce a 64-bit length, which is
/// not supported), then a 4-byte id that is zero for a CIE and otherwise
/// the distance back to the owning CIE from the id field itself.
pub fn parse_eh_frame(path: &str, data: &[u8], io: IoCtx) -> Result<Vec<EhFrameRecord>> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let length = io.read_word(&data[offset..]).map_err(|_| {
            Error::input(path, format!(".eh_frame truncated at offset {offset}"))
        })?;
        if length == 0 {
            records.push(EhFrameRecord {
                offset: offset as u64,
                size: 4,
                kind: EhRecordKind::Terminator,
            });
            break;
        }
        if length == 0xffff_ffff {
            return Err(Error::input(
                path,
                "64-bit .eh_frame length records are not supported",
            ));
        }
        let total = 4 + length as usize;
        if offset + total > data.len() {
            return Err(Error::input(
                path,
                format!(".eh_frame record at {offset} overruns the section"),
            ));
        }
        let id = io.read_word(&data[offset + 4..]).map_err(|_| {
            Error::input(path, format!(".eh_frame record at {offset} has no id"))
        })?;
        let kind = if id == 0 {
            EhRecordKind::Cie
        } else {
            // The pointer counts back from its own field.
            let id_field_offset = offset as u64 + 4;
            if u64::from(id) > id_field_offset {
                return Err(Error::input(
                    path,
                    format!("FDE at {offset} points before the section start"),
                ));
            }
            EhRecordKind::Fde {
                cie_offset: id_field_offset - u64::from(id),
            }
        };
        records.push(EhFrameRecord {
            offset: offset as u64,
            size: total as u64,
            kind,
        });
        offset += total;
    }
    Ok(records)
}

/// One row of the `.eh_frame_hdr` search table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdeTableEntry {
    /// The function's start address
    pub initial_location: u64,
    /// Address of the FDE describing it
    pub fde_address: u64,
}

// DW_EH_PE encodings used by the header.
const DW_EH_PE_PCREL_SDATA4: u8 = 0x1b;
const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_DATAREL_SDATA4: u8 = 0x3b;

/// Serialize `.eh_frame_hdr`: version, encodings, frame pointer, FDE
/// count, then the search table sorted by initial location. `hdr_addr`
/// is the header's own output address (entries are datarel).
pub fn build_eh_frame_hdr(
    io: IoCtx,
    hdr_addr: u64,
    eh_frame_addr: u64,
    entries: &mut Vec<FdeTableEntry>,
) -> Vec<u8> {
    entries.sort_by_key(|e| e.initial_location);
    let mut out = Vec::with_capacity(12 + entries.len() * 8);
    out.push(1); // version
    out.push(DW_EH_PE_PCREL_SDATA4);
    out.push(DW_EH_PE_UDATA4);
    out.push(DW_EH_PE_DATAREL_SDATA4);
    // eh_frame_ptr, pc-relative to its own field at hdr+4.
    io.write_sword(&mut out, eh_frame_addr.wrapping_sub(hdr_addr + 4) as i32);
    io.write_word(&mut out, entries.len() as u32);
    for entry in entries.iter() {
        io.write_sword(&mut out, entry.initial_location.wrapping_sub(hdr_addr) as i32);
        io.write_sword(&mut out, entry.fde_address.wrapping_sub(hdr_addr) as i32);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn io() -> IoCtx {
        IoCtx::elf64_le()
    }

    fn cie(length: u32) -> Vec<u8> {
        let mut out = Vec::new();
        io().write_word(&mut out, length);
        io().write_word(&mut out, 0);
        out.resize(4 + length as usize, 0);
        out
    }

    fn fde(length: u32, cie_back: u32) -> Vec<u8> {
        let mut out = Vec::new();
        io().write_word(&mut out, length);
        io().write_word(&mut out, cie_back);
        out.resize(4 + length as usize, 0);
        out
    }

    #[test]
    fn frames_cie_then_fdes() {
        let mut data = cie(12);
        // FDE at offset 16; id field at 20; back-pointer 20 hits the CIE.
        data.extend(fde(20, 20));
        data.extend([0u8; 4]); // terminator
        let records = parse_eh_frame("a.o", &data, io()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, EhRecordKind::Cie);
        assert_eq!(records[0].size, 16);
        assert_eq!(records[1].kind, EhRecordKind::Fde { cie_offset: 0 });
        assert_eq!(records[1].pc_begin_offset(), 24);
        assert_eq!(records[2].kind, EhRecordKind::Terminator);
    }

    #[test]
    fn extended_length_is_rejected() {
        let mut data = Vec::new();
        io().write_word(&mut data, 0xffff_ffff);
        data.extend([0u8; 12]);
        assert!(parse_eh_frame("a.o", &data, io()).is_err());
    }

    #[test]
    fn fde_pointing_before_section_is_rejected() {
        let data = fde(12, 999);
        assert!(parse_eh_frame("a.o", &data, io()).is_err());
    }

    #[test]
    fn overrunning_record_is_rejected() {
        let mut data = Vec::new();
        io().write_word(&mut data, 100);
        io().write_word(&mut data, 0);
        assert!(parse_eh_frame("a.o", &data, io()).is_err());
    }

    #[test]
    fn header_table_is_sorted_and_datarel() {
        let mut entries = vec![
            FdeTableEntry {
                initial_location: 0x3000,
                fde_address: 0x5010,
            },
            FdeTableEntry {
                initial_location: 0x1000,
                fde_address: 0x5000,
            },
        ];
        let hdr = build_eh_frame_hdr(io(), 0x4000, 0x5000, &mut entries);
        assert_eq!(hdr[0], 1);
        // Count of 2 at offset 8.
        assert_eq!(io().read_word(&hdr[8..]).unwrap(), 2);
        // First table row is the lower address: 0x1000 - 0x4000.
        assert_eq!(io().read_sword(&hdr[12..]).unwrap(), -0x3000);
        assert_eq!(io().read_sword(&hdr[16..]).unwrap(), 0x1000);
    }
}

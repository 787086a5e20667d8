//! Segment assignment: program headers, load coalescing, file offsets,
//! and the page-alignment rules that keep NOBITS cheap

use crate::base::{
    align_up, OutSectId, SectionFlags, SegmentFlags, PT_ARM_EXIDX, PT_DYNAMIC, PT_GNU_EH_FRAME,
    PT_GNU_RELRO, PT_GNU_STACK, PT_INTERP, PT_LOAD, PT_NOTE, PT_PHDR, PT_TLS,
};
use crate::config::{CodeGenType, StackPolicy};
use crate::error::Result;
use crate::module::Module;

#[derive(Debug, Clone)]
/// One program header record
pub struct Segment {
    /// `p_type`
    pub p_type: u32,
    /// `p_flags`
    pub flags: SegmentFlags,
    /// Member output sections, in address order
    pub sections: Vec<OutSectId>,
    /// `p_vaddr`
    pub vaddr: u64,
    /// `p_paddr` (script `AT()` may diverge it from `p_vaddr`)
    pub paddr: u64,
    /// `p_offset`
    pub offset: u64,
    /// `p_filesz`
    pub filesz: u64,
    /// `p_memsz`
    pub memsz: u64,
    /// `p_align`
    pub align: u64,
}

impl Segment {
    fn empty(p_type: u32, flags: SegmentFlags) -> Self {
        Segment {
            p_type,
            flags,
            sections: Vec::new(),
            vaddr: 0,
            paddr: 0,
            offset: 0,
            filesz: 0,
            memsz: 0,
            align: 1,
        }
    }
}

fn prot_of(flags: SectionFlags) -> SegmentFlags {
    let mut prot = SegmentFlags::R;
    if flags.contains(SectionFlags::WRITE) {
        prot |= SegmentFlags::W;
    }
    if flags.contains(SectionFlags::EXECINSTR) {
        prot |= SegmentFlags::X;
    }
    prot
}

impl Module {
    /// Build the program header table from the finalized output sections
    /// and assign file offsets. Loadable sections keep their file offset
    /// congruent to their address modulo the page size; NOBITS sections
    /// take virtual space but never advance the file cursor.
    pub fn create_segments(&mut self) -> Result<()> {
        self.segments.clear();
        if self.config.is_partial() {
            // Relocatable output has no segments; contents start right
            // after the ELF header.
            let ehsize = if self.backend.io.class.word_size() == 8 {
                64
            } else {
                52
            };
            self.assign_file_offsets(ehsize);
            return Ok(());
        }
        let page = self.backend.page_size;

        // One LOAD per contiguous run of identically-protected sections.
        let alloc: Vec<usize> = (0..self.out_sections.len())
            .filter(|idx| self.out_sections[*idx].flags.contains(SectionFlags::ALLOC))
            .collect();
        let mut loads: Vec<Segment> = Vec::new();
        for idx in alloc {
            let out = &self.out_sections[idx];
            if out.size == 0 {
                continue;
            }
            let prot = prot_of(out.flags);
            let start_new = match loads.last() {
                Some(last) => last.flags != prot,
                None => true,
            };
            if start_new {
                let mut seg = Segment::empty(PT_LOAD, prot);
                seg.align = page;
                loads.push(seg);
            }
            if let Some(last) = loads.last_mut() {
                last.sections.push(OutSectId::new(idx));
            }
        }

        let mut segments: Vec<Segment> = Vec::new();
        // The program-header table itself; extents are stamped once the
        // table's own size and the first LOAD placement are known.
        segments.push(Segment::empty(PT_PHDR, SegmentFlags::R));
        if self.dynamic.interp.is_some() {
            if let Some(id) = self.out_index.get(".interp") {
                let mut seg = Segment::empty(PT_INTERP, SegmentFlags::R);
                seg.sections.push(*id);
                segments.push(seg);
            }
        }
        segments.extend(loads);
        if let Some(id) = self.out_index.get(".dynamic") {
            let mut seg = Segment::empty(PT_DYNAMIC, SegmentFlags::R | SegmentFlags::W);
            seg.sections.push(*id);
            segments.push(seg);
        }
        // PT_TLS covers the initialization template.
        let tls_members: Vec<OutSectId> = (0..self.out_sections.len())
            .filter(|i| self.out_sections[*i].flags.contains(SectionFlags::TLS))
            .map(OutSectId::new)
            .collect();
        if !tls_members.is_empty() {
            let mut seg = Segment::empty(PT_TLS, SegmentFlags::R);
            seg.sections = tls_members;
            segments.push(seg);
        }
        if let Some(id) = self.out_index.get(".note.gnu.build-id") {
            let mut seg = Segment::empty(PT_NOTE, SegmentFlags::R);
            seg.sections.push(*id);
            segments.push(seg);
        }
        if let Some(id) = self.out_index.get(".eh_frame_hdr") {
            let mut seg = Segment::empty(PT_GNU_EH_FRAME, SegmentFlags::R);
            seg.sections.push(*id);
            segments.push(seg);
        }
        match self.config.stack {
            StackPolicy::None => {}
            StackPolicy::Exec => {
                segments.push(Segment::empty(
                    PT_GNU_STACK,
                    SegmentFlags::R | SegmentFlags::W | SegmentFlags::X,
                ));
            }
            StackPolicy::NoExec | StackPolicy::FromInputs => {
                segments.push(Segment::empty(
                    PT_GNU_STACK,
                    SegmentFlags::R | SegmentFlags::W,
                ));
            }
        }
        // RELRO: the run of sections made read-only after relocation.
        let relro: Vec<OutSectId> = [".dynamic", ".got"]
            .iter()
            .filter_map(|name| self.out_index.get(*name).copied())
            .filter(|id| self.out_sections[id.index()].size > 0)
            .collect();
        if !relro.is_empty() && !self.config.is_static() {
            let mut seg = Segment::empty(PT_GNU_RELRO, SegmentFlags::R);
            seg.sections = relro;
            segments.push(seg);
        }
        if let Some(unwind) = self.backend.unwind_segment_over {
            if let Some(id) = self.out_index.get(unwind) {
                let mut seg = Segment::empty(PT_ARM_EXIDX, SegmentFlags::R);
                seg.sections.push(*id);
                segments.push(seg);
            }
        }

        // Script PHDRS: a named entry claims the sections whose rules
        // direct themselves at it.
        for phdr in self.script.phdrs.clone() {
            let members: Vec<OutSectId> = (0..self.out_sections.len())
                .filter(|idx| {
                    self.out_sections[*idx]
                        .rule
                        .and_then(|r| self.script.rules.get(r))
                        .map(|r| r.phdrs.contains(&phdr.name))
                        .unwrap_or(false)
                })
                .map(OutSectId::new)
                .collect();
            if members.is_empty() {
                continue;
            }
            let flags = phdr
                .flags
                .unwrap_or_else(|| prot_of(self.out_sections[members[0].index()].flags));
            let mut seg = Segment::empty(phdr.p_type, flags);
            seg.sections = members;
            segments.push(seg);
        }

        let phnum = segments.len();
        let word = self.backend.io.class.word_size();
        let (ehsize, phentsize) = if word == 8 { (64, 56) } else { (52, 32) };
        self.segments = segments;
        self.assign_file_offsets((ehsize + phnum * phentsize) as u64);

        // Segment extents from the placed members.
        for seg in &mut self.segments {
            if seg.sections.is_empty() {
                continue;
            }
            let mut vstart = u64::MAX;
            let mut vend = 0u64;
            let mut fstart = u64::MAX;
            let mut fend = 0u64;
            let mut pstart = u64::MAX;
            for id in &seg.sections {
                let out = &self.out_sections[id.index()];
                vstart = vstart.min(out.addr);
                vend = vend.max(out.addr + out.size);
                pstart = pstart.min(out.load_addr.unwrap_or(out.addr));
                if out.has_file_bytes() {
                    fstart = fstart.min(out.offset);
                    fend = fend.max(out.offset + out.size);
                } else {
                    fstart = fstart.min(out.offset);
                    fend = fend.max(out.offset);
                }
            }
            seg.vaddr = vstart;
            seg.paddr = if pstart == u64::MAX { vstart } else { pstart };
            seg.offset = if fstart == u64::MAX { 0 } else { fstart };
            seg.filesz = if fend >= fstart { fend - fstart } else { 0 };
            seg.memsz = vend - vstart;
        }

        // PT_PHDR covers the table at its file position; its address
        // follows the first LOAD's offset-to-address translation.
        let table_size = (phnum * phentsize) as u64;
        let first_load = self
            .segments
            .iter()
            .find(|s| s.p_type == PT_LOAD)
            .map(|s| (s.vaddr, s.offset));
        for seg in &mut self.segments {
            if seg.p_type != PT_PHDR {
                continue;
            }
            seg.offset = ehsize as u64;
            seg.filesz = table_size;
            seg.memsz = table_size;
            seg.align = word as u64;
            seg.vaddr = match first_load {
                Some((vaddr, offset)) if vaddr >= offset => vaddr - offset + ehsize as u64,
                _ => ehsize as u64,
            };
            seg.paddr = seg.vaddr;
        }
        Ok(())
    }

    /// File offsets: allocatable sections in address order keep offset
    /// congruent to address modulo the page; NOBITS and non-alloc
    /// sections follow without page math.
    fn assign_file_offsets(&mut self, header_size: u64) {
        let page = self.backend.page_size;
        let mut order: Vec<usize> = (0..self.out_sections.len()).collect();
        order.sort_by_key(|idx| {
            let out = &self.out_sections[*idx];
            (
                !out.flags.contains(SectionFlags::ALLOC),
                out.addr,
                *idx,
            )
        });
        let mut cursor = header_size;
        for idx in order {
            let (alloc, addr, align, size, file_bytes) = {
                let out = &self.out_sections[idx];
                (
                    out.flags.contains(SectionFlags::ALLOC),
                    out.addr,
                    out.align.max(1),
                    out.size,
                    out.has_file_bytes(),
                )
            };
            let offset = if alloc && !self.config.is_partial() {
                // Congruence with the virtual address within a page,
                // moving the cursor forward only.
                let want = addr % page;
                let have = cursor % page;
                cursor
                    + if want >= have {
                        want - have
                    } else {
                        page - have + want
                    }
            } else {
                align_up(cursor, align)
            };
            self.out_sections[idx].offset = offset;
            if file_bytes {
                cursor = offset + size;
            } else {
                cursor = offset;
            }
        }
    }

    /// Total file size consumed by section contents (before the section
    /// header table)
    pub fn content_end(&self) -> u64 {
        self.out_sections
            .iter()
            .map(|o| {
                if o.has_file_bytes() {
                    o.offset + o.size
                } else {
                    o.offset
                }
            })
            .max()
            .unwrap_or(0)
    }

    /// Is this section part of a RELRO segment?
    pub fn in_relro(&self, name: &str) -> bool {
        self.segments.iter().any(|seg| {
            seg.p_type == PT_GNU_RELRO
                && seg
                    .sections
                    .iter()
                    .any(|id| self.out_sections[id.index()].name == name)
        })
    }

    /// The entry address: the entry symbol's resolved value, zero for
    /// shared objects without one
    pub fn entry_address(&self) -> u64 {
        let entry_name = self
            .config
            .entry
            .clone()
            .unwrap_or_else(|| self.backend.entry_symbol.to_string());
        match self.pool().find(&entry_name) {
            Some(id) => self.symbol_value(id),
            None => 0,
        }
    }

    /// Partial links and relocatable outputs have no segments at all
    pub fn wants_segments(&self) -> bool {
        !matches!(self.config.codegen, CodeGenType::Object)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn prot_mapping() {
        assert_eq!(prot_of(SectionFlags::ALLOC), SegmentFlags::R);
        assert_eq!(
            prot_of(SectionFlags::ALLOC | SectionFlags::EXECINSTR),
            SegmentFlags::R | SegmentFlags::X
        );
        assert_eq!(
            prot_of(SectionFlags::ALLOC | SectionFlags::WRITE),
            SegmentFlags::R | SegmentFlags::W
        );
    }
}

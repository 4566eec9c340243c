// src/kernel/process/elf.rs
//! Minimal ELF64 image reader
//!
//! Just enough of the format for program loading: magic check, the
//! program-header table, and the entry point. Every read is
//! bounds-checked; a malformed image is an error for the caller, not a
//! kernel fault.

use alloc::vec::Vec;

/// The 32-bit magic at offset 0, read little-endian.
pub const ELF_MAGIC: u64 = 0x464c_457f;

/// Loadable segment type.
pub const PT_LOAD: u64 = 1;
/// Writable segment flag.
pub const PF_W: u64 = 2;

const ELF_QUARTER: usize = 2;
const ELF_HALF: usize = 4;
const ELF_OFF: usize = 8;
const ELF_ADDR: usize = 8;
const ELF_XWORD: usize = 8;

const E_ENTRY: usize = 0x18;
const E_PHOFF: usize = 0x20;
const E_PHENTSIZE: usize = 0x36;
const E_PHNUM: usize = 0x38;

const P_TYPE: usize = 0x0;
const P_FLAGS: usize = 0x4;
const P_OFFSET: usize = 0x8;
const P_VADDR: usize = 0x10;
const P_FILESZ: usize = 0x20;
const P_MEMSZ: usize = 0x28;

/// Why an image was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Wrong magic number.
    BadMagic,
    /// A header or segment points outside the image.
    Truncated,
}

/// Read an `n`-byte little-endian field at `off`.
fn readn(d: &[u8], n: usize, off: usize) -> Result<u64, ElfError> {
    if off + n > d.len() {
        return Err(ElfError::Truncated);
    }
    let mut ret = 0u64;
    for i in 0..n {
        ret |= (d[off + i] as u64) << (i * 8);
    }
    Ok(ret)
}

/// One program header plus its file bytes.
#[derive(Debug)]
pub struct Phdr<'a> {
    /// Segment type.
    pub etype: u64,
    /// Segment flags.
    pub flags: u64,
    /// Target virtual address.
    pub vaddr: u64,
    /// Bytes present in the file.
    pub filesz: usize,
    /// Bytes occupied in memory; the excess over `filesz` is BSS.
    pub memsz: usize,
    /// The segment's file bytes.
    pub sdata: &'a [u8],
}

/// A validated view over an ELF image.
#[derive(Debug)]
pub struct Elf<'a> {
    data: &'a [u8],
}

impl<'a> Elf<'a> {
    /// Validate the magic and the header table location.
    pub fn new(data: &'a [u8]) -> Result<Self, ElfError> {
        if readn(data, ELF_HALF, 0)? != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        let e = Elf { data };
        // force the whole header table through the bounds checks once
        e.headers()?;
        Ok(e)
    }

    /// Number of program headers.
    pub fn npheaders(&self) -> Result<usize, ElfError> {
        Ok(readn(self.data, ELF_QUARTER, E_PHNUM)? as usize)
    }

    /// Decode program header `c`.
    pub fn header(&self, c: usize) -> Result<Phdr<'a>, ElfError> {
        let d = self.data;
        let hoff = readn(d, ELF_OFF, E_PHOFF)? as usize;
        let hsz = readn(d, ELF_QUARTER, E_PHENTSIZE)? as usize;
        let base = hoff + c * hsz;
        let f = |w: usize, sz: usize| readn(d, sz, base + w);

        let etype = f(P_TYPE, ELF_HALF)?;
        let flags = f(P_FLAGS, ELF_HALF)?;
        let vaddr = f(P_VADDR, ELF_ADDR)?;
        let filesz = f(P_FILESZ, ELF_XWORD)? as usize;
        let memsz = f(P_MEMSZ, ELF_XWORD)? as usize;
        let off = f(P_OFFSET, ELF_OFF)? as usize;
        if off + filesz > d.len() {
            return Err(ElfError::Truncated);
        }
        Ok(Phdr {
            etype,
            flags,
            vaddr,
            filesz,
            memsz,
            sdata: &d[off..off + filesz],
        })
    }

    /// All program headers.
    pub fn headers(&self) -> Result<Vec<Phdr<'a>>, ElfError> {
        let num = self.npheaders()?;
        let mut ret = Vec::with_capacity(num);
        for i in 0..num {
            ret.push(self.header(i)?);
        }
        Ok(ret)
    }

    /// Program entry point.
    pub fn entry(&self) -> Result<u64, ElfError> {
        readn(self.data, ELF_ADDR, E_ENTRY)
    }
}

/// Build a one-segment image for the loader tests.
#[cfg(test)]
pub fn mkimage(entry: u64, vaddr: u64, flags: u64, filebytes: &[u8], memsz: usize) -> Vec<u8> {
    let mut img = alloc::vec![0u8; 0x80 + filebytes.len()];
    let wr = |img: &mut Vec<u8>, n: usize, off: usize, val: u64| {
        for i in 0..n {
            img[off + i] = ((val >> (i * 8)) & 0xff) as u8;
        }
    };
    wr(&mut img, ELF_HALF, 0, ELF_MAGIC);
    wr(&mut img, ELF_ADDR, E_ENTRY, entry);
    wr(&mut img, ELF_OFF, E_PHOFF, 0x40);
    wr(&mut img, ELF_QUARTER, E_PHENTSIZE, 0x38);
    wr(&mut img, ELF_QUARTER, E_PHNUM, 1);
    wr(&mut img, ELF_HALF, 0x40 + P_TYPE, PT_LOAD);
    wr(&mut img, ELF_HALF, 0x40 + P_FLAGS, flags);
    wr(&mut img, ELF_OFF, 0x40 + P_OFFSET, 0x80);
    wr(&mut img, ELF_ADDR, 0x40 + P_VADDR, vaddr);
    wr(&mut img, ELF_XWORD, 0x40 + P_FILESZ, filebytes.len() as u64);
    wr(&mut img, ELF_XWORD, 0x40 + P_MEMSZ, memsz as u64);
    img[0x80..0x80 + filebytes.len()].copy_from_slice(filebytes);
    img
}

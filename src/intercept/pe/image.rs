//! Reading the import table of a PE image that is already mapped.
//!
//! Works on any byte slice laid out like a loaded image (RVAs are offsets
//! into the slice), so it runs the same over a live module and over a test
//! fixture. Every read is bounds checked; a malformed image is an error,
//! never a fault.

use std::ffi::CStr;

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

const MZ: u16 = 0x5a4d;
const PE_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const IMPORT_DIRECTORY: usize = 1;
const E_LFANEW: usize = 0x3c;

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct FileHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct ImportDescriptor {
    original_first_thunk: u32,
    time_date_stamp: u32,
    forwarder_chain: u32,
    name: u32,
    first_thunk: u32,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

/// Where the fields we need live in each optional header flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Pe32,
    Pe32Plus,
}

impl Format {
    const SIZE_OF_IMAGE: usize = 56;

    fn number_of_rva_and_sizes(self) -> usize {
        match self {
            Format::Pe32 => 92,
            Format::Pe32Plus => 108,
        }
    }

    fn data_directory(self) -> usize {
        self.number_of_rva_and_sizes() + 4
    }

    /// Width of an import thunk.
    pub fn thunk_size(self) -> usize {
        match self {
            Format::Pe32 => 4,
            Format::Pe32Plus => 8,
        }
    }

    fn ordinal_flag(self) -> u64 {
        match self {
            Format::Pe32 => 1 << 31,
            Format::Pe32Plus => 1 << 63,
        }
    }
}

/// One by-name import.
#[derive(Clone, Copy, Debug)]
pub struct Import<'a> {
    /// The DLL it is imported from, as spelled in the image.
    pub dll: &'a CStr,
    pub symbol: &'a CStr,
    /// RVA of the slot the loader filled with the symbol's address.
    pub slot_rva: u32,
}

/// A validated view of a mapped PE image.
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    bytes: &'a [u8],
    format: Format,
    imports: DataDirectory,
}

impl<'a> ImageView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let not_an_image = |reason| Error::NotAnImage {
            base: bytes.as_ptr() as usize,
            reason,
        };
        let probe = Probe { bytes };
        if probe.u16(0) != Some(MZ) {
            return Err(not_an_image("missing MZ signature"));
        }
        let nt = probe
            .u32(E_LFANEW)
            .map(|off| off as usize)
            .ok_or_else(|| not_an_image("truncated DOS header"))?;
        if probe.u32(nt) != Some(PE_SIGNATURE) {
            return Err(not_an_image("missing PE signature"));
        }
        let optional = nt + 4 + std::mem::size_of::<FileHeader>();
        let format = match probe.u16(optional) {
            Some(PE32_MAGIC) => Format::Pe32,
            Some(PE32_PLUS_MAGIC) => Format::Pe32Plus,
            _ => return Err(not_an_image("unknown optional header magic")),
        };
        let size_of_image = probe
            .u32(optional + Format::SIZE_OF_IMAGE)
            .ok_or_else(|| not_an_image("truncated optional header"))? as usize;
        if size_of_image > bytes.len() {
            return Err(not_an_image("image larger than its mapping"));
        }
        let bytes = &bytes[..size_of_image];
        let probe = Probe { bytes };
        let directories = probe
            .u32(optional + format.number_of_rva_and_sizes())
            .ok_or_else(|| not_an_image("truncated optional header"))? as usize;
        let imports = if directories > IMPORT_DIRECTORY {
            probe
                .pod::<DataDirectory>(optional + format.data_directory() + IMPORT_DIRECTORY * 8)
                .ok_or_else(|| not_an_image("truncated data directory"))?
        } else {
            DataDirectory::zeroed()
        };
        Ok(Self {
            bytes,
            format,
            imports,
        })
    }

    /// View a module the loader has mapped.
    ///
    /// # Safety
    ///
    /// `base` is the base address of a mapped image that stays mapped for
    /// `'a`.
    pub unsafe fn from_module(base: *const u8) -> Result<ImageView<'a>> {
        let not_an_image = |reason| Error::NotAnImage {
            base: base as usize,
            reason,
        };
        if base.is_null() {
            return Err(not_an_image("null module"));
        }
        // The headers are always mapped; read just enough of them to learn
        // how big the whole image is.
        let dos = std::slice::from_raw_parts(base, E_LFANEW + 4);
        let dos = Probe { bytes: dos };
        if dos.u16(0) != Some(MZ) {
            return Err(not_an_image("missing MZ signature"));
        }
        let nt = (base.add(E_LFANEW) as *const u32).read_unaligned() as usize;
        let optional = nt + 4 + std::mem::size_of::<FileHeader>();
        let header = std::slice::from_raw_parts(base, optional + Format::SIZE_OF_IMAGE + 4);
        let size_of_image = Probe { bytes: header }
            .u32(optional + Format::SIZE_OF_IMAGE)
            .ok_or_else(|| not_an_image("truncated optional header"))?;
        ImageView::parse(std::slice::from_raw_parts(base, size_of_image as usize))
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn size_of_image(&self) -> usize {
        self.bytes.len()
    }

    /// Call `f` with every by-name import. Ordinal imports are skipped, and
    /// a descriptor that points outside the image ends the walk.
    pub fn for_each_import(&self, mut f: impl FnMut(Import<'a>)) {
        if self.imports.virtual_address == 0 {
            return;
        }
        let probe = Probe { bytes: self.bytes };
        let width = self.format.thunk_size();
        let mut at = self.imports.virtual_address as usize;
        while let Some(descriptor) = probe.pod::<ImportDescriptor>(at) {
            if descriptor.name == 0 {
                break;
            }
            at += std::mem::size_of::<ImportDescriptor>();
            let Some(dll) = probe.cstr(descriptor.name as usize) else {
                break;
            };
            // Bound images may have no lookup table; the slots still hold
            // the names until the loader binds them.
            let lookup = match descriptor.original_first_thunk {
                0 => descriptor.first_thunk,
                rva => rva,
            } as usize;
            let slots = descriptor.first_thunk as usize;
            let mut i = 0;
            while let Some(thunk) = probe.thunk(lookup + i * width, self.format) {
                if thunk == 0 {
                    break;
                }
                let slot_rva = (slots + i * width) as u32;
                i += 1;
                if thunk & self.format.ordinal_flag() != 0 {
                    continue;
                }
                // Skip the two-byte hint in IMAGE_IMPORT_BY_NAME.
                let Some(symbol) = probe.cstr((thunk as u32 as usize) + 2) else {
                    continue;
                };
                f(Import {
                    dll,
                    symbol,
                    slot_rva,
                });
            }
        }
    }

    /// The first import slot for `symbol` from a DLL accepted by `from`.
    pub fn find_import(&self, symbol: &CStr, from: impl Fn(&CStr) -> bool) -> Option<u32> {
        let mut found = None;
        self.for_each_import(|import| {
            if found.is_none() && import.symbol == symbol && from(import.dll) {
                found = Some(import.slot_rva);
            }
        });
        found
    }
}

/// Bounds-checked little-endian reads.
#[derive(Clone, Copy)]
struct Probe<'a> {
    bytes: &'a [u8],
}

impl<'a> Probe<'a> {
    fn pod<T: Pod>(self, at: usize) -> Option<T> {
        let end = at.checked_add(std::mem::size_of::<T>())?;
        self.bytes.get(at..end).map(bytemuck::pod_read_unaligned)
    }

    fn u16(self, at: usize) -> Option<u16> {
        self.pod::<u16>(at).map(u16::from_le)
    }

    fn u32(self, at: usize) -> Option<u32> {
        self.pod::<u32>(at).map(u32::from_le)
    }

    fn thunk(self, at: usize, format: Format) -> Option<u64> {
        match format {
            Format::Pe32 => self.u32(at).map(u64::from),
            Format::Pe32Plus => self.pod::<u64>(at).map(u64::from_le),
        }
    }

    fn cstr(self, at: usize) -> Option<&'a CStr> {
        CStr::from_bytes_until_nul(self.bytes.get(at..)?).ok()
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    //! Hand-assembled images for tests: headers, one import descriptor per
    //! DLL, and the lookup/slot tables, all inside one buffer.

    use super::*;

    pub const SIZE: usize = 0x2000;
    const NT: usize = 0x80;
    const IMPORTS: usize = 0x400;

    pub struct Builder {
        pub bytes: Vec<u8>,
        format: Format,
        next: usize,
        descriptors: usize,
    }

    impl Builder {
        pub fn new(format: Format) -> Self {
            let mut bytes = vec![0u8; SIZE];
            bytes[0..2].copy_from_slice(&MZ.to_le_bytes());
            bytes[E_LFANEW..E_LFANEW + 4].copy_from_slice(&(NT as u32).to_le_bytes());
            bytes[NT..NT + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
            let optional = NT + 4 + std::mem::size_of::<FileHeader>();
            let magic = match format {
                Format::Pe32 => PE32_MAGIC,
                Format::Pe32Plus => PE32_PLUS_MAGIC,
            };
            bytes[optional..optional + 2].copy_from_slice(&magic.to_le_bytes());
            let put32 = |bytes: &mut Vec<u8>, at: usize, v: u32| {
                bytes[at..at + 4].copy_from_slice(&v.to_le_bytes())
            };
            put32(&mut bytes, optional + Format::SIZE_OF_IMAGE, SIZE as u32);
            put32(&mut bytes, optional + format.number_of_rva_and_sizes(), 16);
            let import_dir = optional + format.data_directory() + IMPORT_DIRECTORY * 8;
            put32(&mut bytes, import_dir, IMPORTS as u32);
            put32(&mut bytes, import_dir + 4, 0x100);
            Self {
                bytes,
                format,
                next: 0x800,
                descriptors: 0,
            }
        }

        fn put(&mut self, at: usize, data: &[u8]) {
            self.bytes[at..at + data.len()].copy_from_slice(data);
        }

        fn string(&mut self, s: &str) -> usize {
            let at = self.next;
            self.put(at, s.as_bytes());
            self.next += s.len() + 1;
            self.next = (self.next + 1) & !1;
            at
        }

        /// Add a descriptor importing `symbols` from `dll`. A symbol of the
        /// form `#N` is imported by ordinal.
        pub fn import(mut self, dll: &str, symbols: &[&str]) -> Self {
            let width = self.format.thunk_size();
            let dll_rva = self.string(dll);
            let mut thunks = Vec::new();
            for symbol in symbols {
                let thunk = match symbol.strip_prefix('#') {
                    Some(n) => self.format.ordinal_flag() | n.parse::<u64>().unwrap(),
                    None => {
                        // Two-byte hint, then the name.
                        let at = self.next;
                        self.next += 2;
                        self.string(symbol);
                        at as u64
                    }
                };
                thunks.push(thunk);
            }
            let table = |this: &mut Self| {
                let at = this.next;
                for (i, thunk) in thunks.iter().enumerate() {
                    let bytes = thunk.to_le_bytes();
                    this.put(at + i * width, &bytes[..width]);
                }
                this.next += (thunks.len() + 1) * width;
                at
            };
            let lookup = table(&mut self);
            let slots = table(&mut self);
            let descriptor = ImportDescriptor {
                original_first_thunk: lookup as u32,
                time_date_stamp: 0,
                forwarder_chain: 0,
                name: dll_rva as u32,
                first_thunk: slots as u32,
            };
            let at = IMPORTS + self.descriptors * std::mem::size_of::<ImportDescriptor>();
            self.put(at, bytemuck::bytes_of(&descriptor));
            self.descriptors += 1;
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{fixture::Builder, *};

    fn collect(view: &ImageView<'_>) -> Vec<(String, String, u32)> {
        let mut out = Vec::new();
        view.for_each_import(|import| {
            out.push((
                import.dll.to_string_lossy().into_owned(),
                import.symbol.to_string_lossy().into_owned(),
                import.slot_rva,
            ))
        });
        out
    }

    #[test]
    fn walks_pe32_plus_imports() {
        let image = Builder::new(Format::Pe32Plus)
            .import("KERNEL32.dll", &["HeapAlloc", "#17"])
            .import("ucrtbase.dll", &["malloc", "free"]);
        let view = ImageView::parse(&image.bytes).unwrap();
        assert_eq!(view.format(), Format::Pe32Plus);
        let imports = collect(&view);
        let names: Vec<_> = imports
            .iter()
            .map(|(dll, sym, _)| (dll.as_str(), sym.as_str()))
            .collect();
        assert_eq!(
            names,
            [("KERNEL32.dll", "HeapAlloc"), ("ucrtbase.dll", "malloc"), ("ucrtbase.dll", "free")]
        );
        // Slots of one descriptor are consecutive thunks.
        assert_eq!(imports[2].2 - imports[1].2, 8);
    }

    #[test]
    fn walks_pe32_imports() {
        let image = Builder::new(Format::Pe32).import("msvcrt.dll", &["calloc", "realloc"]);
        let view = ImageView::parse(&image.bytes).unwrap();
        assert_eq!(view.format(), Format::Pe32);
        let imports = collect(&view);
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[1].2 - imports[0].2, 4);
        let slot = view.find_import(c"realloc", |dll| dll == c"msvcrt.dll");
        assert_eq!(slot, Some(imports[1].2));
        assert_eq!(view.find_import(c"realloc", |_| false), None);
    }

    #[test]
    fn rejects_what_is_not_an_image() {
        assert!(ImageView::parse(&[0u8; 64]).is_err());
        let mut image = Builder::new(Format::Pe32Plus).bytes;
        image[0x80] = b'X';
        assert!(matches!(
            ImageView::parse(&image),
            Err(Error::NotAnImage { reason: "missing PE signature", .. })
        ));
        // Claims to be bigger than the buffer it lives in.
        let image = Builder::new(Format::Pe32Plus).bytes;
        assert!(ImageView::parse(&image[..fixture::SIZE / 2]).is_err());
    }

    #[test]
    fn live_module_view_matches_slice_view() {
        let image = Builder::new(Format::Pe32Plus).import("ucrtbase.dll", &["malloc"]);
        let view = unsafe { ImageView::from_module(image.bytes.as_ptr()) }.unwrap();
        assert_eq!(view.size_of_image(), fixture::SIZE);
        assert_eq!(collect(&view).len(), 1);
    }

    #[test]
    fn live_module_without_a_dos_header_is_rejected() {
        let blank = vec![0u8; fixture::SIZE];
        assert!(matches!(
            unsafe { ImageView::from_module(blank.as_ptr()) },
            Err(Error::NotAnImage { reason: "missing MZ signature", .. })
        ));
    }
}

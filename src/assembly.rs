//! Lightweight reader for .NET assemblies.
//!
//! Parses the PE container down to the CLI header, the metadata root and
//! its streams, then reads the handful of metadata tables needed to find a
//! method body by type and method name and to resolve `ldstr` tokens.
//! Only the first 0x12 tables are sized, which is enough to locate
//! `TypeDef`, `MethodDef` and `StandAloneSig`.
use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;
use tracing::warn;

use crate::metadata::{Metadata, MethodBody};
use crate::value::Utf16String;

type Result<T> = std::result::Result<T, ImageError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("unexpected end of image reading {what} at offset {offset}")]
    Truncated { what: &'static str, offset: usize },
    #[error("bad {0} signature")]
    BadSignature(&'static str),
    #[error("rva 0x{0:08x} is not mapped by any section")]
    UnmappedRva(u32),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {what}: {detail}")]
    Invalid { what: &'static str, detail: String },
}

fn invalid(what: &'static str, detail: impl Into<String>) -> ImageError {
    ImageError::Invalid {
        what,
        detail: detail.into(),
    }
}

// Metadata table numbers, ECMA-335 II.22.
const MODULE: usize = 0x00;
const TYPE_REF: usize = 0x01;
const TYPE_DEF: usize = 0x02;
const FIELD_PTR: usize = 0x03;
const FIELD: usize = 0x04;
const METHOD_PTR: usize = 0x05;
const METHOD_DEF: usize = 0x06;
const PARAM_PTR: usize = 0x07;
const PARAM: usize = 0x08;
const INTERFACE_IMPL: usize = 0x09;
const MEMBER_REF: usize = 0x0A;
const CONSTANT: usize = 0x0B;
const CUSTOM_ATTRIBUTE: usize = 0x0C;
const FIELD_MARSHAL: usize = 0x0D;
const DECL_SECURITY: usize = 0x0E;
const CLASS_LAYOUT: usize = 0x0F;
const FIELD_LAYOUT: usize = 0x10;
const STAND_ALONE_SIG: usize = 0x11;
const EVENT: usize = 0x14;
const PROPERTY: usize = 0x17;
const MODULE_REF: usize = 0x1A;
const TYPE_SPEC: usize = 0x1B;
const ASSEMBLY: usize = 0x20;
const ASSEMBLY_REF: usize = 0x23;
const FILE: usize = 0x26;
const EXPORTED_TYPE: usize = 0x27;
const MANIFEST_RESOURCE: usize = 0x28;
const GENERIC_PARAM: usize = 0x2A;
const METHOD_SPEC: usize = 0x2B;
const GENERIC_PARAM_CONSTRAINT: usize = 0x2C;

/// Tables whose rows we know how to size.
const SIZED_TABLES: usize = STAND_ALONE_SIG + 1;

/// Token type of user string tokens (`ldstr`).
pub const USER_STRING_TOKEN: u32 = 0x70;

const METADATA_SIGNATURE: u32 = 0x424A_5342;
const LOCAL_SIG: u8 = 0x07;

/// Little-endian reader over the image bytes.
struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn at(bytes: &'a [u8], offset: usize, what: &'static str) -> Self {
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(offset as u64);
        Self { cursor, what }
    }

    fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    fn truncated(&self, offset: usize) -> ImageError {
        ImageError::Truncated {
            what: self.what,
            offset,
        }
    }

    fn skip(&mut self, n: usize) {
        self.cursor.set_position(self.cursor.position() + n as u64);
    }

    fn u8(&mut self) -> Result<u8> {
        let offset = self.offset();
        self.cursor.read_u8().map_err(|_| self.truncated(offset))
    }

    fn u16(&mut self) -> Result<u16> {
        let offset = self.offset();
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| self.truncated(offset))
    }

    fn u32(&mut self) -> Result<u32> {
        let offset = self.offset();
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated(offset))
    }

    fn u64(&mut self) -> Result<u64> {
        let offset = self.offset();
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| self.truncated(offset))
    }

    /// Heap or table index, two or four bytes wide.
    fn index(&mut self, wide: bool) -> Result<u32> {
        if wide {
            self.u32()
        } else {
            self.u16().map(u32::from)
        }
    }

    /// Stream name: null terminated, padded to a four byte boundary.
    fn stream_name(&mut self) -> Result<String> {
        let mut name = Vec::new();
        loop {
            match self.u8()? {
                0 => break,
                b => name.push(b),
            }
        }
        let consumed = name.len() + 1;
        self.skip((4 - consumed % 4) % 4);
        String::from_utf8(name).map_err(|e| invalid("stream name", e.to_string()))
    }
}

/// Decode a compressed unsigned integer (ECMA-335 II.23.2), returns the
/// value and the number of bytes it took.
pub fn decode_compressed(bytes: &[u8]) -> Option<(u32, usize)> {
    let b0 = u32::from(*bytes.first()?);
    if b0 & 0x80 == 0 {
        Some((b0, 1))
    } else if b0 & 0xC0 == 0x80 {
        let b1 = u32::from(*bytes.get(1)?);
        Some((((b0 & 0x3F) << 8) | b1, 2))
    } else if b0 & 0xE0 == 0xC0 {
        let rest = bytes.get(1..4)?;
        let value = ((b0 & 0x1F) << 24)
            | (u32::from(rest[0]) << 16)
            | (u32::from(rest[1]) << 8)
            | u32::from(rest[2]);
        Some((value, 4))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    raw_offset: u32,
}

impl Section {
    fn contains(&self, rva: u32) -> bool {
        let size = self.virtual_size.max(self.raw_size);
        rva >= self.virtual_address && rva - self.virtual_address < size
    }
}

/// Row counts, row sizes and offsets of the metadata tables.
#[derive(Debug, Clone)]
struct Tables {
    rows: [u32; 64],
    heap_sizes: u8,
    row_sizes: [usize; SIZED_TABLES],
    offsets: [usize; SIZED_TABLES],
}

impl Tables {
    fn parse(bytes: &[u8], start: usize) -> Result<Self> {
        let mut r = Reader::at(bytes, start, "tables header");
        r.skip(4);
        let _major = r.u8()?;
        let _minor = r.u8()?;
        let heap_sizes = r.u8()?;
        r.skip(1);
        let valid = r.u64()?;
        let _sorted = r.u64()?;

        let mut rows = [0u32; 64];
        for (table, count) in rows.iter_mut().enumerate() {
            if valid & (1u64 << table) != 0 {
                *count = r.u32()?;
            }
        }
        // Uncompressed streams may carry four bytes of extra data.
        if heap_sizes & 0x40 != 0 {
            r.skip(4);
        }

        let row_sizes = row_sizes(&rows, heap_sizes);
        let mut offsets = [0usize; SIZED_TABLES];
        let mut cursor = r.offset();
        for table in 0..SIZED_TABLES {
            offsets[table] = cursor;
            cursor += rows[table] as usize * row_sizes[table];
        }
        if cursor > bytes.len() {
            return Err(ImageError::Truncated {
                what: "metadata tables",
                offset: cursor,
            });
        }

        Ok(Self {
            rows,
            heap_sizes,
            row_sizes,
            offsets,
        })
    }

    fn wide_strings(&self) -> bool {
        self.heap_sizes & 0x01 != 0
    }

    fn wide_blobs(&self) -> bool {
        self.heap_sizes & 0x04 != 0
    }

    fn wide_index(&self, table: usize) -> bool {
        self.rows[table] >= 0x1_0000
    }

    fn row_offset(&self, table: usize, row: u32) -> Result<usize> {
        if row == 0 || row > self.rows[table] {
            return Err(invalid(
                "row index",
                format!("row {row} of table 0x{table:02x} with {} rows", self.rows[table]),
            ));
        }
        Ok(self.offsets[table] + (row as usize - 1) * self.row_sizes[table])
    }
}

/// Row sizes of the first `SIZED_TABLES` tables, ECMA-335 II.22 and the
/// coded index encodings of II.24.2.6.
fn row_sizes(rows: &[u32; 64], heap_sizes: u8) -> [usize; SIZED_TABLES] {
    let string = if heap_sizes & 0x01 != 0 { 4 } else { 2 };
    let guid = if heap_sizes & 0x02 != 0 { 4 } else { 2 };
    let blob = if heap_sizes & 0x04 != 0 { 4 } else { 2 };
    let index = |table: usize| if rows[table] < 0x1_0000 { 2 } else { 4 };
    let coded = |tag_bits: u32, tables: &[usize]| {
        let max = tables.iter().map(|t| rows[*t]).max().unwrap_or(0);
        if max < (1 << (16 - tag_bits)) {
            2
        } else {
            4
        }
    };

    let type_def_or_ref = coded(2, &[TYPE_DEF, TYPE_REF, TYPE_SPEC]);
    let resolution_scope = coded(2, &[MODULE, MODULE_REF, ASSEMBLY_REF, TYPE_REF]);
    let member_ref_parent = coded(3, &[TYPE_DEF, TYPE_REF, MODULE_REF, METHOD_DEF, TYPE_SPEC]);
    let has_constant = coded(2, &[FIELD, PARAM, PROPERTY]);
    let has_custom_attribute = coded(
        5,
        &[
            METHOD_DEF,
            FIELD,
            TYPE_REF,
            TYPE_DEF,
            PARAM,
            INTERFACE_IMPL,
            MEMBER_REF,
            MODULE,
            DECL_SECURITY,
            PROPERTY,
            EVENT,
            STAND_ALONE_SIG,
            MODULE_REF,
            TYPE_SPEC,
            ASSEMBLY,
            ASSEMBLY_REF,
            FILE,
            EXPORTED_TYPE,
            MANIFEST_RESOURCE,
            GENERIC_PARAM,
            GENERIC_PARAM_CONSTRAINT,
            METHOD_SPEC,
        ],
    );
    let custom_attribute_type = coded(3, &[METHOD_DEF, MEMBER_REF]);
    let has_field_marshal = coded(1, &[FIELD, PARAM]);
    let has_decl_security = coded(2, &[TYPE_DEF, METHOD_DEF, ASSEMBLY]);

    let mut sizes = [0usize; SIZED_TABLES];
    sizes[MODULE] = 2 + string + 3 * guid;
    sizes[TYPE_REF] = resolution_scope + 2 * string;
    sizes[TYPE_DEF] = 4 + 2 * string + type_def_or_ref + index(FIELD) + index(METHOD_DEF);
    sizes[FIELD_PTR] = index(FIELD);
    sizes[FIELD] = 2 + string + blob;
    sizes[METHOD_PTR] = index(METHOD_DEF);
    sizes[METHOD_DEF] = 4 + 2 + 2 + string + blob + index(PARAM);
    sizes[PARAM_PTR] = index(PARAM);
    sizes[PARAM] = 2 + 2 + string;
    sizes[INTERFACE_IMPL] = index(TYPE_DEF) + type_def_or_ref;
    sizes[MEMBER_REF] = member_ref_parent + string + blob;
    sizes[CONSTANT] = 2 + has_constant + blob;
    sizes[CUSTOM_ATTRIBUTE] = has_custom_attribute + custom_attribute_type + blob;
    sizes[FIELD_MARSHAL] = has_field_marshal + blob;
    sizes[DECL_SECURITY] = 2 + has_decl_security + blob;
    sizes[CLASS_LAYOUT] = 2 + 4 + index(TYPE_DEF);
    sizes[FIELD_LAYOUT] = 4 + index(FIELD);
    sizes[STAND_ALONE_SIG] = blob;
    sizes
}

struct TypeDefRow {
    name: u32,
    namespace: u32,
    method_list: u32,
}

struct MethodDefRow {
    rva: u32,
    name: u32,
}

/// A loaded assembly image.
#[derive(Debug, Clone)]
pub struct Assembly {
    bytes: Vec<u8>,
    sections: Vec<Section>,
    strings: Range<usize>,
    user_strings: Range<usize>,
    blobs: Range<usize>,
    tables: Tables,
}

impl Assembly {
    /// Parse a PE image holding CLI metadata.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let mut r = Reader::at(&bytes, 0, "DOS header");
        if r.u16()? != 0x5A4D {
            return Err(ImageError::BadSignature("MZ"));
        }
        let pe = Reader::at(&bytes, 0x3C, "DOS header").u32()? as usize;

        let mut r = Reader::at(&bytes, pe, "PE header");
        if r.u32()? != 0x0000_4550 {
            return Err(ImageError::BadSignature("PE"));
        }
        let _machine = r.u16()?;
        let section_count = r.u16()? as usize;
        r.skip(12);
        let optional_size = r.u16()? as usize;

        let optional = pe + 24;
        let mut r = Reader::at(&bytes, optional, "optional header");
        let directories = match r.u16()? {
            0x10B => optional + 96,
            0x20B => optional + 112,
            magic => return Err(invalid("optional header magic", format!("0x{magic:04x}"))),
        };
        let directory_count = Reader::at(&bytes, directories - 4, "optional header").u32()?;
        // Data directory 14 is the CLI header.
        let mut r = Reader::at(&bytes, directories + 14 * 8, "data directories");
        let cli_rva = if directory_count > 14 { r.u32()? } else { 0 };
        if cli_rva == 0 {
            return Err(ImageError::Missing("CLI header"));
        }

        let mut sections = Vec::with_capacity(section_count);
        let mut r = Reader::at(&bytes, optional + optional_size, "section table");
        for _ in 0..section_count {
            r.skip(8);
            let virtual_size = r.u32()?;
            let virtual_address = r.u32()?;
            let raw_size = r.u32()?;
            let raw_offset = r.u32()?;
            r.skip(16);
            sections.push(Section {
                virtual_address,
                virtual_size,
                raw_size,
                raw_offset,
            });
        }

        let cli = rva_to_offset(&sections, cli_rva)?;
        let mut r = Reader::at(&bytes, cli + 8, "CLI header");
        let metadata_rva = r.u32()?;
        let metadata_size = r.u32()? as usize;
        let root = rva_to_offset(&sections, metadata_rva)?;
        if root + metadata_size > bytes.len() {
            return Err(ImageError::Truncated {
                what: "metadata root",
                offset: root,
            });
        }

        let mut r = Reader::at(&bytes, root, "metadata root");
        if r.u32()? != METADATA_SIGNATURE {
            return Err(ImageError::BadSignature("metadata"));
        }
        r.skip(8);
        let version_len = r.u32()? as usize;
        r.skip(version_len);
        let _flags = r.u16()?;
        let stream_count = r.u16()?;

        let mut tables = None;
        let mut strings = None;
        let mut user_strings = None;
        let mut blobs = None;
        for _ in 0..stream_count {
            let offset = r.u32()? as usize;
            let size = r.u32()? as usize;
            let name = r.stream_name()?;
            let range = root + offset..root + offset + size;
            if range.end > bytes.len() {
                return Err(ImageError::Truncated {
                    what: "metadata stream",
                    offset: range.start,
                });
            }
            match name.as_str() {
                "#~" | "#-" => tables = Some(range),
                "#Strings" => strings = Some(range),
                "#US" => user_strings = Some(range),
                "#Blob" => blobs = Some(range),
                _ => {}
            }
        }

        let tables = tables.ok_or(ImageError::Missing("#~ stream"))?;
        let tables = Tables::parse(&bytes, tables.start)?;
        Ok(Self {
            strings: strings.ok_or(ImageError::Missing("#Strings stream"))?,
            // An assembly without string literals may omit these two.
            user_strings: user_strings.unwrap_or(0..0),
            blobs: blobs.unwrap_or(0..0),
            tables,
            sections,
            bytes,
        })
    }

    /// Namespace qualified names of all types defined in the assembly.
    pub fn type_names(&self) -> Result<Vec<String>> {
        (1..=self.tables.rows[TYPE_DEF])
            .map(|row| {
                let def = self.type_def(row)?;
                self.qualified_name(&def)
            })
            .collect()
    }

    /// Find the body of `method_name` on `type_name`. `Ok(None)` when the
    /// type or method does not exist or the method has no body.
    pub fn find_method(&self, type_name: &str, method_name: &str) -> Result<Option<MethodBody>> {
        let type_row = match self.find_type(type_name)? {
            Some(row) => row,
            None => return Ok(None),
        };
        for method_row in self.method_rows(type_row)? {
            let method = self.method_def(method_row)?;
            if self.string(method.name)? != method_name {
                continue;
            }
            if method.rva == 0 {
                // Abstract, extern or runtime provided.
                return Ok(None);
            }
            return self.method_body_at(method.rva).map(Some);
        }
        Ok(None)
    }

    /// Resolve a user string token. `Ok(None)` for tokens that are not
    /// user string tokens or point outside the heap.
    pub fn read_user_string(&self, token: u32) -> Result<Option<Utf16String>> {
        if token >> 24 != USER_STRING_TOKEN {
            return Ok(None);
        }
        let offset = (token & 0x00FF_FFFF) as usize;
        let heap = &self.bytes[self.user_strings.clone()];
        if offset == 0 || offset >= heap.len() {
            return Ok(None);
        }
        let (len, consumed) = decode_compressed(&heap[offset..])
            .ok_or_else(|| invalid("user string length", format!("offset {offset}")))?;
        let start = offset + consumed;
        let payload = heap
            .get(start..start + len as usize)
            .ok_or(ImageError::Truncated {
                what: "user string",
                offset: self.user_strings.start + start,
            })?;
        // The last byte flags non-ASCII content and is not part of the text.
        let text = &payload[..payload.len().saturating_sub(1) & !1];
        let mut units = vec![0u16; text.len() / 2];
        LittleEndian::read_u16_into(text, &mut units);
        Ok(Some(Utf16String::from_units(units)))
    }

    fn find_type(&self, type_name: &str) -> Result<Option<u32>> {
        for row in 1..=self.tables.rows[TYPE_DEF] {
            let def = self.type_def(row)?;
            if self.qualified_name(&def)? == type_name {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn qualified_name(&self, def: &TypeDefRow) -> Result<String> {
        let name = self.string(def.name)?;
        let namespace = self.string(def.namespace)?;
        Ok(if namespace.is_empty() {
            name.to_string()
        } else {
            format!("{namespace}.{name}")
        })
    }

    fn type_def(&self, row: u32) -> Result<TypeDefRow> {
        let start = self.tables.row_offset(TYPE_DEF, row)?;
        let mut r = Reader::at(&self.bytes, start + 4, "TypeDef row");
        let name = r.index(self.tables.wide_strings())?;
        let namespace = r.index(self.tables.wide_strings())?;
        // MethodList is the last column.
        let method_list_width = if self.tables.wide_index(METHOD_DEF) { 4 } else { 2 };
        let method_list = Reader::at(
            &self.bytes,
            start + self.tables.row_sizes[TYPE_DEF] - method_list_width,
            "TypeDef row",
        )
        .index(self.tables.wide_index(METHOD_DEF))?;
        Ok(TypeDefRow {
            name,
            namespace,
            method_list,
        })
    }

    /// `MethodDef` rows owned by the type at `type_row`. A type's methods
    /// run up to the next type's method list, or to the end of the table.
    fn method_rows(&self, type_row: u32) -> Result<Vec<u32>> {
        let indirect = self.tables.rows[METHOD_PTR] > 0;
        let list_len = if indirect {
            self.tables.rows[METHOD_PTR]
        } else {
            self.tables.rows[METHOD_DEF]
        };
        let first = self.type_def(type_row)?.method_list;
        let end = if type_row < self.tables.rows[TYPE_DEF] {
            self.type_def(type_row + 1)?.method_list
        } else {
            list_len + 1
        };

        (first..end.min(list_len + 1))
            .map(|i| {
                if indirect {
                    let start = self.tables.row_offset(METHOD_PTR, i)?;
                    Reader::at(&self.bytes, start, "MethodPtr row")
                        .index(self.tables.wide_index(METHOD_DEF))
                } else {
                    Ok(i)
                }
            })
            .collect()
    }

    fn method_def(&self, row: u32) -> Result<MethodDefRow> {
        let start = self.tables.row_offset(METHOD_DEF, row)?;
        let mut r = Reader::at(&self.bytes, start, "MethodDef row");
        let rva = r.u32()?;
        r.skip(4);
        let name = r.index(self.tables.wide_strings())?;
        Ok(MethodDefRow { rva, name })
    }

    /// Decode the tiny or fat method header at `rva` (ECMA-335 II.25.4).
    fn method_body_at(&self, rva: u32) -> Result<MethodBody> {
        let offset = rva_to_offset(&self.sections, rva)?;
        let mut r = Reader::at(&self.bytes, offset, "method header");
        let first = r.u8()?;
        match first & 0x03 {
            0x02 => {
                let code_size = usize::from(first >> 2);
                let code = self.slice(offset + 1, code_size, "method body")?;
                Ok(MethodBody::new(code.to_vec(), 0, 8))
            }
            0x03 => {
                let mut r = Reader::at(&self.bytes, offset, "method header");
                let flags_and_size = r.u16()?;
                let header_len = usize::from(flags_and_size >> 12) * 4;
                let max_stack = r.u16()?;
                let code_size = r.u32()? as usize;
                let local_sig = r.u32()?;
                let code = self.slice(offset + header_len, code_size, "method body")?;
                Ok(MethodBody::new(
                    code.to_vec(),
                    self.local_count(local_sig)?,
                    usize::from(max_stack),
                ))
            }
            format => Err(invalid("method header", format!("format bits {format:#x}"))),
        }
    }

    /// Number of locals declared by the `StandAloneSig` at `token`.
    fn local_count(&self, token: u32) -> Result<usize> {
        if token == 0 {
            return Ok(0);
        }
        if (token >> 24) as usize != STAND_ALONE_SIG {
            return Err(invalid("local signature token", format!("0x{token:08x}")));
        }
        let start = self.tables.row_offset(STAND_ALONE_SIG, token & 0x00FF_FFFF)?;
        let blob_index = Reader::at(&self.bytes, start, "StandAloneSig row")
            .index(self.tables.wide_blobs())?;
        let sig = self.blob(blob_index)?;
        if sig.first() != Some(&LOCAL_SIG) {
            return Err(invalid("local signature", format!("blob {blob_index}")));
        }
        let (count, _) = decode_compressed(&sig[1..])
            .ok_or_else(|| invalid("local signature", "bad count"))?;
        Ok(count as usize)
    }

    fn string(&self, index: u32) -> Result<&str> {
        let heap = &self.bytes[self.strings.clone()];
        let start = index as usize;
        let tail = heap.get(start..).ok_or(ImageError::Truncated {
            what: "#Strings heap",
            offset: self.strings.start + start,
        })?;
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).map_err(|e| invalid("string", e.to_string()))
    }

    fn blob(&self, index: u32) -> Result<&[u8]> {
        let heap = &self.bytes[self.blobs.clone()];
        let start = index as usize;
        let (len, consumed) = heap
            .get(start..)
            .and_then(decode_compressed)
            .ok_or_else(|| invalid("blob", format!("index {index}")))?;
        heap.get(start + consumed..start + consumed + len as usize)
            .ok_or(ImageError::Truncated {
                what: "#Blob heap",
                offset: self.blobs.start + start,
            })
    }

    fn slice(&self, start: usize, len: usize, what: &'static str) -> Result<&[u8]> {
        self.bytes
            .get(start..start.saturating_add(len))
            .ok_or(ImageError::Truncated {
                what,
                offset: start,
            })
    }
}

fn rva_to_offset(sections: &[Section], rva: u32) -> Result<usize> {
    let section = sections
        .iter()
        .find(|s| s.contains(rva))
        .ok_or(ImageError::UnmappedRva(rva))?;
    (rva - section.virtual_address)
        .checked_add(section.raw_offset)
        .map(|offset| offset as usize)
        .ok_or_else(|| invalid("section", format!("rva 0x{rva:08x} maps past 4 GiB")))
}

impl Metadata for Assembly {
    fn user_string(&self, token: u32) -> Option<Utf16String> {
        self.read_user_string(token).unwrap_or_else(|err| {
            warn!(token, "cannot read user string: {err}");
            None
        })
    }

    fn method_body(&self, type_name: &str, method_name: &str) -> Option<MethodBody> {
        self.find_method(type_name, method_name).unwrap_or_else(|err| {
            warn!(type_name, method_name, "cannot read method: {err}");
            None
        })
    }
}

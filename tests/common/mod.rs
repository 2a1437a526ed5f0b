//! Builds minimal PE32 images with CLI metadata: one `.text` section
//! holding the CLI header, method bodies and the metadata root with
//! `#~`, `#Strings`, `#US` and `#Blob` streams.
#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};

const FILE_ALIGNMENT: usize = 0x200;
const SECTION_RVA: u32 = 0x2000;
const CLI_HEADER_SIZE: usize = 72;

enum Header {
    Tiny,
    Fat { max_stack: u16, locals: u8 },
    Abstract,
}

struct Method {
    name: String,
    code: Vec<u8>,
    header: Header,
}

struct Type {
    namespace: String,
    name: String,
    methods: Vec<Method>,
}

pub struct ImageBuilder {
    types: Vec<Type>,
    user_strings: Vec<u8>,
}

impl ImageBuilder {
    /// Starts with the `<Module>` pseudo type every assembly has.
    pub fn new() -> Self {
        Self {
            types: vec![Type {
                namespace: String::new(),
                name: "<Module>".into(),
                methods: Vec::new(),
            }],
            user_strings: vec![0],
        }
    }

    /// Start a new type; following methods belong to it.
    pub fn class(&mut self, namespace: &str, name: &str) -> &mut Self {
        self.types.push(Type {
            namespace: namespace.into(),
            name: name.into(),
            methods: Vec::new(),
        });
        self
    }

    pub fn tiny(&mut self, name: &str, code: &[u8]) -> &mut Self {
        assert!(code.len() < 64, "tiny bodies hold at most 63 bytes");
        self.method(name, code, Header::Tiny)
    }

    pub fn fat(&mut self, name: &str, code: &[u8], max_stack: u16, locals: u8) -> &mut Self {
        self.method(name, code, Header::Fat { max_stack, locals })
    }

    pub fn abstract_method(&mut self, name: &str) -> &mut Self {
        self.method(name, &[], Header::Abstract)
    }

    fn method(&mut self, name: &str, code: &[u8], header: Header) -> &mut Self {
        let owner = self.types.last_mut().expect("module type is always present");
        owner.methods.push(Method {
            name: name.into(),
            code: code.to_vec(),
            header,
        });
        self
    }

    /// Add a literal to `#US` and return its `ldstr` token.
    pub fn user_string(&mut self, text: &str) -> u32 {
        let offset = self.user_strings.len() as u32;
        let units: Vec<u16> = text.encode_utf16().collect();
        write_compressed(&mut self.user_strings, units.len() as u32 * 2 + 1);
        for unit in units {
            self.user_strings.write_u16::<LittleEndian>(unit).unwrap();
        }
        self.user_strings.push(0);
        0x7000_0000 | offset
    }

    pub fn build(&self) -> Vec<u8> {
        let mut strings = vec![0u8];
        let mut blobs = vec![0u8];
        let mut signatures: Vec<u16> = Vec::new();
        let mut text = vec![0u8; CLI_HEADER_SIZE];

        // Method bodies, and the rows pointing at them.
        let mut type_rows = Vec::new();
        let mut method_rows = Vec::new();
        for ty in &self.types {
            let name = intern(&mut strings, &ty.name);
            let namespace = intern(&mut strings, &ty.namespace);
            type_rows.push((name, namespace, method_rows.len() as u16 + 1));
            for method in &ty.methods {
                let name = intern(&mut strings, &method.name);
                let rva = match method.header {
                    Header::Abstract => 0,
                    Header::Tiny => {
                        let rva = SECTION_RVA + text.len() as u32;
                        text.push(((method.code.len() as u8) << 2) | 0x02);
                        text.extend_from_slice(&method.code);
                        rva
                    }
                    Header::Fat { max_stack, locals } => {
                        align(&mut text, 4);
                        let rva = SECTION_RVA + text.len() as u32;
                        let local_sig = if locals > 0 {
                            let blob = blobs.len() as u16;
                            write_compressed(&mut blobs, 2 + u32::from(locals));
                            blobs.extend_from_slice(&[0x07, locals]);
                            // ELEMENT_TYPE_I4 for every local.
                            blobs.extend(std::iter::repeat(0x08).take(usize::from(locals)));
                            signatures.push(blob);
                            0x1100_0000 | signatures.len() as u32
                        } else {
                            0
                        };
                        // Fat format, init locals, three dword header.
                        text.write_u16::<LittleEndian>(0x3013).unwrap();
                        text.write_u16::<LittleEndian>(max_stack).unwrap();
                        text.write_u32::<LittleEndian>(method.code.len() as u32).unwrap();
                        text.write_u32::<LittleEndian>(local_sig).unwrap();
                        text.extend_from_slice(&method.code);
                        rva
                    }
                };
                method_rows.push((rva, name));
            }
        }

        let module_name = intern(&mut strings, "test.dll");
        let tables = tables_stream(module_name, &type_rows, &method_rows, &signatures);
        let mut user_strings = self.user_strings.clone();
        align(&mut strings, 4);
        align(&mut user_strings, 4);
        align(&mut blobs, 4);

        align(&mut text, 4);
        let metadata_offset = text.len();
        let root = metadata_root(&[
            ("#~", &tables),
            ("#Strings", &strings),
            ("#US", &user_strings),
            ("#Blob", &blobs),
        ]);
        text.extend_from_slice(&root);

        let mut cli = Vec::with_capacity(CLI_HEADER_SIZE);
        cli.write_u32::<LittleEndian>(CLI_HEADER_SIZE as u32).unwrap();
        cli.write_u16::<LittleEndian>(2).unwrap();
        cli.write_u16::<LittleEndian>(5).unwrap();
        cli.write_u32::<LittleEndian>(SECTION_RVA + metadata_offset as u32).unwrap();
        cli.write_u32::<LittleEndian>(root.len() as u32).unwrap();
        // IL only.
        cli.write_u32::<LittleEndian>(1).unwrap();
        text[..cli.len()].copy_from_slice(&cli);

        pe_file(text)
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn intern(heap: &mut Vec<u8>, text: &str) -> u16 {
    if text.is_empty() {
        return 0;
    }
    let at = heap.len() as u16;
    heap.extend_from_slice(text.as_bytes());
    heap.push(0);
    at
}

fn align(buf: &mut Vec<u8>, to: usize) {
    while buf.len() % to != 0 {
        buf.push(0);
    }
}

fn write_compressed(buf: &mut Vec<u8>, value: u32) {
    if value < 0x80 {
        buf.push(value as u8);
    } else if value < 0x4000 {
        buf.write_u16::<byteorder::BigEndian>(0x8000 | value as u16).unwrap();
    } else {
        buf.write_u32::<byteorder::BigEndian>(0xC000_0000 | value).unwrap();
    }
}

fn tables_stream(
    module_name: u16,
    types: &[(u16, u16, u16)],
    methods: &[(u32, u16)],
    signatures: &[u16],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.push(2);
    out.push(0);
    // Narrow heaps.
    out.push(0);
    out.push(1);
    let mut valid: u64 = 1 << 0x00 | 1 << 0x02 | 1 << 0x06;
    if !signatures.is_empty() {
        valid |= 1 << 0x11;
    }
    out.write_u64::<LittleEndian>(valid).unwrap();
    out.write_u64::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(1).unwrap();
    out.write_u32::<LittleEndian>(types.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(methods.len() as u32).unwrap();
    if !signatures.is_empty() {
        out.write_u32::<LittleEndian>(signatures.len() as u32).unwrap();
    }

    // Module: generation, name, mvid, enc id, enc base id.
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(module_name).unwrap();
    out.extend_from_slice(&[0; 6]);

    // TypeDef: flags, name, namespace, extends, field list, method list.
    for (i, (name, namespace, method_list)) in types.iter().enumerate() {
        let flags = if i == 0 { 0 } else { 0x0010_0001 };
        out.write_u32::<LittleEndian>(flags).unwrap();
        out.write_u16::<LittleEndian>(*name).unwrap();
        out.write_u16::<LittleEndian>(*namespace).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(1).unwrap();
        out.write_u16::<LittleEndian>(*method_list).unwrap();
    }

    // MethodDef: rva, impl flags, flags, name, signature, param list.
    for (rva, name) in methods {
        out.write_u32::<LittleEndian>(*rva).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0x0096).unwrap();
        out.write_u16::<LittleEndian>(*name).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(1).unwrap();
    }

    for blob in signatures {
        out.write_u16::<LittleEndian>(*blob).unwrap();
    }
    align(&mut out, 4);
    out
}

fn metadata_root(streams: &[(&str, &[u8])]) -> Vec<u8> {
    let version = b"v4.0.30319\0\0";
    let header_len = |name: &str| 8 + (name.len() + 4) / 4 * 4;
    let mut offset =
        16 + version.len() + 4 + streams.iter().map(|(n, _)| header_len(n)).sum::<usize>();

    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(0x424A_5342).unwrap();
    out.write_u16::<LittleEndian>(1).unwrap();
    out.write_u16::<LittleEndian>(1).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(version.len() as u32).unwrap();
    out.extend_from_slice(version);
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(streams.len() as u16).unwrap();
    for (name, data) in streams {
        out.write_u32::<LittleEndian>(offset as u32).unwrap();
        out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        align(&mut out, 4);
        offset += data.len();
    }
    for (_, data) in streams {
        out.extend_from_slice(data);
    }
    out
}

fn pe_file(mut text: Vec<u8>) -> Vec<u8> {
    let virtual_size = text.len() as u32;
    align(&mut text, FILE_ALIGNMENT);

    let mut out = vec![0u8; 0x80];
    out[0] = b'M';
    out[1] = b'Z';
    out[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());

    out.extend_from_slice(b"PE\0\0");
    // COFF: i386, one section, optional header size, executable dll.
    out.write_u16::<LittleEndian>(0x014C).unwrap();
    out.write_u16::<LittleEndian>(1).unwrap();
    out.extend_from_slice(&[0; 12]);
    out.write_u16::<LittleEndian>(0xE0).unwrap();
    out.write_u16::<LittleEndian>(0x2102).unwrap();

    // PE32 optional header, only the fields the reader looks at are set.
    let optional = out.len();
    out.write_u16::<LittleEndian>(0x10B).unwrap();
    out.resize(optional + 92, 0);
    out.write_u32::<LittleEndian>(16).unwrap();
    for directory in 0..16 {
        let (rva, size) = if directory == 14 {
            (SECTION_RVA, CLI_HEADER_SIZE as u32)
        } else {
            (0, 0)
        };
        out.write_u32::<LittleEndian>(rva).unwrap();
        out.write_u32::<LittleEndian>(size).unwrap();
    }
    assert_eq!(out.len(), optional + 0xE0);

    out.extend_from_slice(b".text\0\0\0");
    out.write_u32::<LittleEndian>(virtual_size).unwrap();
    out.write_u32::<LittleEndian>(SECTION_RVA).unwrap();
    out.write_u32::<LittleEndian>(text.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(FILE_ALIGNMENT as u32).unwrap();
    out.extend_from_slice(&[0; 12]);
    out.write_u32::<LittleEndian>(0x6000_0020).unwrap();

    out.resize(FILE_ALIGNMENT, 0);
    out.extend_from_slice(&text);
    out
}

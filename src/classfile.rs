use std::ops::Range;

use anyhow::{Context, Result};

use crate::ir::{Constant, HandleKind, MethodHandle};

/// Constant pool entry as seen by the layout reader.
#[derive(Clone, Debug)]
pub(crate) enum CpEntry {
    Utf8(String),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    MemberRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    InvokeDynamic {
        bootstrap_index: u16,
        name_and_type_index: u16,
    },
    Other,
}

/// Attribute name and the byte range of its payload inside the class file.
#[derive(Clone, Debug)]
pub(crate) struct RawAttribute {
    pub(crate) name: String,
    pub(crate) payload: Range<usize>,
}

/// `field_info` or `method_info` record with its full byte span.
#[derive(Clone, Debug)]
pub(crate) struct RawMember {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<RawAttribute>,
    pub(crate) span: Range<usize>,
}

/// Constant pool queries the bytecode walk resolves operands through.
pub(crate) trait ConstantLookup {
    fn type_name(&self, index: u16) -> Result<String>;

    /// Owner, name and descriptor of a field, method or interface method reference.
    fn member_ref(&self, index: u16) -> Result<(String, String, String)>;

    fn method_handle(&self, index: u16) -> Result<MethodHandle>;

    /// Loadable constant at `index`, as used by ldc and bootstrap arguments.
    fn constant(&self, index: u16) -> Result<Constant>;

    /// Bootstrap method index, name and descriptor of an invokedynamic constant.
    fn invoke_dynamic(&self, index: u16) -> Result<(u16, String, String)>;
}

#[derive(Clone, Debug)]
pub(crate) struct BootstrapMethod {
    pub(crate) method_ref: u16,
    pub(crate) arguments: Vec<u16>,
}

/// Byte-level layout of a class file. Remembers where each `method_info` lives so the
/// method table can be rewritten without re-encoding the rest of the class, and serves
/// as a structural decoder for classes `jclassfile` rejects.
#[derive(Clone, Debug)]
pub(crate) struct ClassLayout {
    pub(crate) constant_pool: Vec<CpEntry>,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<RawMember>,
    pub(crate) methods: Vec<RawMember>,
    /// Offset of `methods_count`.
    pub(crate) methods_offset: usize,
    /// Offset just past the last `method_info`.
    pub(crate) methods_end: usize,
    pub(crate) attributes: Vec<RawAttribute>,
}

impl ClassLayout {
    pub(crate) fn parse(data: &[u8]) -> Result<ClassLayout> {
        let mut offset = 0usize;
        let magic = read_u32(data, &mut offset)?;
        if magic != 0xCAFEBABE {
            anyhow::bail!("invalid class file magic");
        }
        let _minor = read_u16(data, &mut offset)?;
        let _major = read_u16(data, &mut offset)?;
        let constant_pool = parse_constant_pool(data, &mut offset).context("parse constant pool")?;
        let access_flags = read_u16(data, &mut offset)?;
        let this_class = read_u16(data, &mut offset)?;
        let super_class = read_u16(data, &mut offset)?;
        let interface_count = read_u16(data, &mut offset)?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(read_u16(data, &mut offset)?);
        }
        let fields = parse_members(data, &mut offset, &constant_pool).context("parse fields")?;
        let methods_offset = offset;
        let methods = parse_members(data, &mut offset, &constant_pool).context("parse methods")?;
        let methods_end = offset;
        let attributes =
            parse_attributes(data, &mut offset, &constant_pool).context("parse class attributes")?;

        Ok(ClassLayout {
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            methods_offset,
            methods_end,
            attributes,
        })
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<&str> {
        utf8_at(&self.constant_pool, index)
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<&str> {
        match self.constant_pool.get(index as usize) {
            Some(CpEntry::Class { name_index }) => self.utf8(*name_index),
            _ => anyhow::bail!("constant {index} is not a class entry"),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.constant_pool.get(index as usize) {
            Some(CpEntry::NameAndType {
                name_index,
                descriptor_index,
            }) => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => anyhow::bail!("constant {index} is not a name and type entry"),
        }
    }

    pub(crate) fn member_key(&self, member: &RawMember) -> Result<(&str, &str)> {
        Ok((
            self.utf8(member.name_index)?,
            self.utf8(member.descriptor_index)?,
        ))
    }

    /// BootstrapMethods table, read from the raw payload.
    pub(crate) fn bootstrap_methods(&self, data: &[u8]) -> Result<Vec<BootstrapMethod>> {
        let Some(attribute) = find_attribute(&self.attributes, "BootstrapMethods") else {
            return Ok(Vec::new());
        };
        let mut offset = attribute.payload.start;
        let count = read_u16(data, &mut offset)?;
        let mut methods = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let method_ref = read_u16(data, &mut offset)?;
            let argument_count = read_u16(data, &mut offset)?;
            let mut arguments = Vec::with_capacity(argument_count as usize);
            for _ in 0..argument_count {
                arguments.push(read_u16(data, &mut offset)?);
            }
            methods.push(BootstrapMethod {
                method_ref,
                arguments,
            });
        }
        Ok(methods)
    }
}

impl ConstantLookup for ClassLayout {
    fn type_name(&self, index: u16) -> Result<String> {
        Ok(self.class_name(index)?.to_string())
    }

    fn member_ref(&self, index: u16) -> Result<(String, String, String)> {
        match self.constant_pool.get(index as usize) {
            Some(CpEntry::MemberRef {
                class_index,
                name_and_type_index,
            }) => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok((owner.to_string(), name.to_string(), descriptor.to_string()))
            }
            _ => anyhow::bail!("constant {index} is not a member reference"),
        }
    }

    fn method_handle(&self, index: u16) -> Result<MethodHandle> {
        match self.constant_pool.get(index as usize) {
            Some(CpEntry::MethodHandle {
                kind,
                reference_index,
            }) => {
                let kind = HandleKind::from_tag(*kind)
                    .with_context(|| format!("invalid method handle kind {kind}"))?;
                let (owner, name, descriptor) = self.member_ref(*reference_index)?;
                Ok(MethodHandle {
                    kind,
                    owner,
                    name,
                    descriptor,
                })
            }
            _ => anyhow::bail!("constant {index} is not a method handle"),
        }
    }

    fn constant(&self, index: u16) -> Result<Constant> {
        let entry = self
            .constant_pool
            .get(index as usize)
            .with_context(|| format!("missing constant {index}"))?;
        let constant = match entry {
            CpEntry::String { string_index } => Constant::String(self.utf8(*string_index)?.to_string()),
            CpEntry::Class { name_index } => Constant::Class(self.utf8(*name_index)?.to_string()),
            CpEntry::MethodType { descriptor_index } => {
                Constant::MethodType(self.utf8(*descriptor_index)?.to_string())
            }
            CpEntry::MethodHandle { .. } => Constant::MethodHandle(self.method_handle(index)?),
            _ => Constant::Other,
        };
        Ok(constant)
    }

    fn invoke_dynamic(&self, index: u16) -> Result<(u16, String, String)> {
        match self.constant_pool.get(index as usize) {
            Some(CpEntry::InvokeDynamic {
                bootstrap_index,
                name_and_type_index,
            }) => {
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok((*bootstrap_index, name.to_string(), descriptor.to_string()))
            }
            _ => anyhow::bail!("constant {index} is not an invokedynamic entry"),
        }
    }
}

pub(crate) fn find_attribute<'a>(attributes: &'a [RawAttribute], name: &str) -> Option<&'a RawAttribute> {
    attributes.iter().find(|attribute| attribute.name == name)
}

/// Re-emit `data` keeping only the methods accepted by `keep(name, descriptor)`.
/// Kept `method_info` records are copied verbatim and in their original order; the
/// constant pool and every other part of the class are left untouched.
pub(crate) fn retain_methods<F>(data: &[u8], mut keep: F) -> Result<Vec<u8>>
where
    F: FnMut(&str, &str) -> bool,
{
    let layout = ClassLayout::parse(data)?;
    let mut kept = Vec::new();
    for method in &layout.methods {
        let (name, descriptor) = layout.member_key(method)?;
        if keep(name, descriptor) {
            kept.push(method.span.clone());
        }
    }

    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..layout.methods_offset]);
    out.extend_from_slice(&(kept.len() as u16).to_be_bytes());
    for span in kept {
        out.extend_from_slice(&data[span]);
    }
    out.extend_from_slice(&data[layout.methods_end..]);
    Ok(out)
}

fn utf8_at(constant_pool: &[CpEntry], index: u16) -> Result<&str> {
    match constant_pool.get(index as usize) {
        Some(CpEntry::Utf8(value)) => Ok(value),
        _ => anyhow::bail!("constant {index} is not a utf8 entry"),
    }
}

fn parse_constant_pool(data: &[u8], offset: &mut usize) -> Result<Vec<CpEntry>> {
    let count = read_u16(data, offset)?;
    let mut entries = Vec::with_capacity(count as usize);
    entries.push(CpEntry::Other);
    let mut index = 1u16;
    while index < count {
        let tag = read_u8(data, offset)?;
        let entry = match tag {
            1 => {
                let len = read_u16(data, offset)? as usize;
                let bytes = read_bytes(data, offset, len)?;
                CpEntry::Utf8(String::from_utf8_lossy(bytes).to_string())
            }
            3 | 4 => {
                skip_bytes(data, offset, 4)?;
                CpEntry::Other
            }
            5 | 6 => {
                skip_bytes(data, offset, 8)?;
                entries.push(CpEntry::Other);
                index += 1;
                CpEntry::Other
            }
            7 => CpEntry::Class {
                name_index: read_u16(data, offset)?,
            },
            8 => CpEntry::String {
                string_index: read_u16(data, offset)?,
            },
            9 | 10 | 11 => CpEntry::MemberRef {
                class_index: read_u16(data, offset)?,
                name_and_type_index: read_u16(data, offset)?,
            },
            12 => CpEntry::NameAndType {
                name_index: read_u16(data, offset)?,
                descriptor_index: read_u16(data, offset)?,
            },
            15 => CpEntry::MethodHandle {
                kind: read_u8(data, offset)?,
                reference_index: read_u16(data, offset)?,
            },
            16 => CpEntry::MethodType {
                descriptor_index: read_u16(data, offset)?,
            },
            17 => {
                skip_bytes(data, offset, 4)?;
                CpEntry::Other
            }
            18 => CpEntry::InvokeDynamic {
                bootstrap_index: read_u16(data, offset)?,
                name_and_type_index: read_u16(data, offset)?,
            },
            19 | 20 => {
                skip_bytes(data, offset, 2)?;
                CpEntry::Other
            }
            _ => anyhow::bail!("unsupported constant pool tag: {}", tag),
        };
        entries.push(entry);
        index += 1;
    }
    Ok(entries)
}

fn parse_members(data: &[u8], offset: &mut usize, constant_pool: &[CpEntry]) -> Result<Vec<RawMember>> {
    let count = read_u16(data, offset)?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start = *offset;
        let access_flags = read_u16(data, offset)?;
        let name_index = read_u16(data, offset)?;
        let descriptor_index = read_u16(data, offset)?;
        let attributes = parse_attributes(data, offset, constant_pool)?;
        members.push(RawMember {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
            span: start..*offset,
        });
    }
    Ok(members)
}

fn parse_attributes(
    data: &[u8],
    offset: &mut usize,
    constant_pool: &[CpEntry],
) -> Result<Vec<RawAttribute>> {
    let count = read_u16(data, offset)?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = read_u16(data, offset)?;
        let len = read_u32(data, offset)? as usize;
        let start = *offset;
        skip_bytes(data, offset, len)?;
        let name = utf8_at(constant_pool, name_index)
            .context("resolve attribute name")?
            .to_string();
        attributes.push(RawAttribute {
            name,
            payload: start..*offset,
        });
    }
    Ok(attributes)
}

fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    let byte = *data.get(*offset).context("class file out of bounds")?;
    *offset += 1;
    Ok(byte)
}

fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16> {
    let bytes = read_bytes(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = read_bytes(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_bytes<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let start = *offset;
    let end = start.checked_add(len).context("class file out of bounds")?;
    let slice = data.get(start..end).context("class file out of bounds")?;
    *offset = end;
    Ok(slice)
}

fn skip_bytes(data: &[u8], offset: &mut usize, len: usize) -> Result<()> {
    read_bytes(data, offset, len)?;
    Ok(())
}

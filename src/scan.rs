use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file::{self, ClassFile};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::attributes::{self, resolve_class_name, resolve_utf8};
use crate::classfile::{BootstrapMethod, ClassLayout, ConstantLookup, find_attribute};
use crate::descriptor::internal_name;
use crate::ir::{
    CallKind, CallSite, Class, Constant, DynamicCallSite, Field, FieldRef, Instruction,
    InstructionKind, Method, MethodAccess, MethodBody, TypeOp,
};
use crate::opcodes;

/// One archive entry, kept in archive order so the output mirrors the input layout.
pub(crate) struct JarEntry {
    pub(crate) name: String,
    pub(crate) data: Vec<u8>,
    pub(crate) is_dir: bool,
    /// Internal name of the decoded class stored in this entry.
    pub(crate) class_name: Option<String>,
}

/// `META-INF/services/<service>` registration.
#[derive(Clone, Debug)]
pub(crate) struct ProviderRegistration {
    pub(crate) service: String,
    pub(crate) providers: Vec<String>,
}

/// Snapshot of the input archive: raw entries plus everything decoded from them.
#[derive(Default)]
pub(crate) struct JarContents {
    pub(crate) entries: Vec<JarEntry>,
    pub(crate) classes: Vec<Class>,
    pub(crate) providers: Vec<ProviderRegistration>,
    /// Class entries that failed to decode and are copied through unchanged.
    pub(crate) undecodable: Vec<String>,
}

pub(crate) fn read_jar(path: &Path) -> Result<JarContents> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut contents = JarContents::default();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = entry.name().to_string();
        if entry.is_dir() {
            contents.entries.push(JarEntry {
                name,
                data: Vec::new(),
                is_dir: true,
                class_name: None,
            });
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;

        let mut class_name = None;
        if is_class_entry(&name) {
            match decode_class(&data) {
                Ok(class) => {
                    class_name = Some(class.name.clone());
                    contents.classes.push(class);
                }
                Err(err) => {
                    warn!(entry = %name, "failed to decode class, copying unchanged: {err:#}");
                    contents.undecodable.push(name.clone());
                }
            }
        } else if let Some(service) = name.strip_prefix("META-INF/services/") {
            if !service.is_empty() && !service.contains('/') {
                contents.providers.push(ProviderRegistration {
                    service: internal_name(service),
                    providers: parse_provider_file(&data),
                });
            }
        }
        contents.entries.push(JarEntry {
            name,
            data,
            is_dir: false,
            class_name,
        });
    }

    debug!(
        entries = contents.entries.len(),
        classes = contents.classes.len(),
        providers = contents.providers.len(),
        "read {}",
        path.display()
    );
    Ok(contents)
}

/// Decode library classes from JARs and directories. Undecodable entries are skipped.
pub(crate) fn scan_classpath(classpath: &[PathBuf]) -> Result<Vec<Class>> {
    let mut classes = Vec::new();

    // Keep deterministic ordering by sorting classpath entries and directory listings.
    let mut entries = classpath.to_vec();
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        scan_path(&entry, true, &mut classes)?;
    }
    Ok(classes)
}

fn scan_path(path: &Path, strict: bool, classes: &mut Vec<Class>) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, classes);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" => {
            let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            push_decoded(&path.display().to_string(), &data, classes);
            Ok(())
        }
        "jar" => scan_jar_file(path, classes),
        _ => {
            if strict {
                anyhow::bail!("unsupported classpath entry: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn scan_dir(path: &Path, classes: &mut Vec<Class>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        scan_path(&entry, false, classes)?;
    }
    Ok(())
}

fn scan_jar_file(path: &Path, classes: &mut Vec<Class>) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if !entry.is_dir() && is_class_entry(entry.name()) {
            entry_names.push(entry.name().to_string());
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        push_decoded(&format!("{}:{}", path.display(), name), &data, classes);
    }
    Ok(())
}

fn push_decoded(origin: &str, data: &[u8], classes: &mut Vec<Class>) {
    match decode_class(data) {
        Ok(class) => classes.push(class),
        Err(err) => warn!(entry = %origin, "skipping undecodable classpath class: {err:#}"),
    }
}

fn is_class_entry(name: &str) -> bool {
    name.ends_with(".class")
        && !name.ends_with("module-info.class")
        && !name.starts_with("META-INF/versions/")
}

/// Provider class names from a service file: one per line, `#` starts a comment.
pub(crate) fn parse_provider_file(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(internal_name)
        .collect()
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Decode class bytes into IR. Everything comes from `jclassfile`; a class it rejects
/// (an attribute it does not model, such as SourceDebugExtension) falls back to the
/// byte layout, which yields the header, members and bytecode but no attribute payloads.
pub(crate) fn decode_class(data: &[u8]) -> Result<Class> {
    match class_file::parse(data) {
        Ok(parsed) => decode_parsed(&parsed).context("failed to decode class structure"),
        Err(err) => {
            let layout = ClassLayout::parse(data).context("failed to read class layout")?;
            let class = decode_layout(data, &layout).context("failed to decode class structure")?;
            debug!(class = %class.name, "decoded from layout without attributes: {err}");
            Ok(class)
        }
    }
}

fn decode_parsed(parsed: &ClassFile) -> Result<Class> {
    let pool = parsed.constant_pool().as_slice();
    let name = resolve_class_name(pool, parsed.this_class()).context("resolve class name")?;
    let super_name = if parsed.super_class() == 0 {
        None
    } else {
        Some(resolve_class_name(pool, parsed.super_class()).context("resolve super class name")?)
    };
    let mut interfaces = Vec::with_capacity(parsed.interfaces().len());
    for interface in parsed.interfaces() {
        interfaces.push(resolve_class_name(pool, *interface).context("resolve interface name")?);
    }
    let bootstrap_methods = attributes::bootstrap_methods(parsed.attributes());

    let mut fields = Vec::with_capacity(parsed.fields().len());
    for field in parsed.fields() {
        fields.push(Field {
            name: resolve_utf8(pool, field.name_index()).context("resolve field name")?,
            descriptor: resolve_utf8(pool, field.descriptor_index()).context("resolve field descriptor")?,
            signature: attributes::signature(pool, field.attributes())?,
            annotations: attributes::annotation_descriptors(pool, field.attributes())?,
        });
    }

    let mut methods = Vec::with_capacity(parsed.methods().len());
    for method in parsed.methods() {
        let method_name = resolve_utf8(pool, method.name_index()).context("resolve method name")?;
        let descriptor =
            resolve_utf8(pool, method.descriptor_index()).context("resolve method descriptor")?;
        let body = match attributes::code(method.attributes()) {
            Some((code, exception_table, code_attributes)) => Some(MethodBody {
                instructions: parse_bytecode(code, pool, &bootstrap_methods)
                    .with_context(|| format!("parse bytecode of {method_name}{descriptor}"))?,
                catch_types: attributes::catch_types(pool, exception_table)?,
                local_signatures: attributes::local_variable_signatures(pool, code_attributes)?,
            }),
            None => None,
        };
        methods.push(Method {
            access: MethodAccess::new(method.access_flags().bits()),
            signature: attributes::signature(pool, method.attributes())?,
            exceptions: attributes::exceptions(pool, method.attributes())?,
            annotations: attributes::annotation_descriptors(pool, method.attributes())?,
            name: method_name,
            descriptor,
            body,
        });
    }

    let (outer_class, outer_method_descriptor) = match attributes::enclosing_method(pool, parsed.attributes())? {
        Some((owner, descriptor)) => (Some(owner), descriptor),
        None => (None, None),
    };

    Ok(Class {
        name,
        access_flags: parsed.access_flags().bits(),
        super_name,
        interfaces,
        signature: attributes::signature(pool, parsed.attributes())?,
        outer_class,
        outer_method_descriptor,
        annotations: attributes::annotation_descriptors(pool, parsed.attributes())?,
        fields,
        methods,
    })
}

/// Structural decode from the byte layout, for classes `jclassfile` rejects.
fn decode_layout(data: &[u8], layout: &ClassLayout) -> Result<Class> {
    let name = layout.class_name(layout.this_class)?.to_string();
    let super_name = if layout.super_class == 0 {
        None
    } else {
        Some(layout.class_name(layout.super_class)?.to_string())
    };
    let mut interfaces = Vec::with_capacity(layout.interfaces.len());
    for interface in &layout.interfaces {
        interfaces.push(layout.class_name(*interface)?.to_string());
    }
    let bootstrap_methods = layout.bootstrap_methods(data).context("read bootstrap methods")?;

    let mut fields = Vec::with_capacity(layout.fields.len());
    for field in &layout.fields {
        let (field_name, descriptor) = layout.member_key(field).context("resolve field")?;
        fields.push(Field {
            name: field_name.to_string(),
            descriptor: descriptor.to_string(),
            signature: None,
            annotations: Vec::new(),
        });
    }

    let mut methods = Vec::with_capacity(layout.methods.len());
    for method in &layout.methods {
        let (method_name, descriptor) = layout.member_key(method)?;
        let body = match find_attribute(&method.attributes, "Code") {
            Some(attribute) => {
                let payload = &data[attribute.payload.clone()];
                let code_length = read_u32(payload, 4)? as usize;
                let code = payload.get(8..8 + code_length).context("code out of bounds")?;
                let table = 8 + code_length;
                let handler_count = read_u16(payload, table)? as usize;
                let mut catch_types = Vec::new();
                for handler in 0..handler_count {
                    let catch_type = read_u16(payload, table + 2 + handler * 8 + 6)?;
                    if catch_type != 0 {
                        catch_types.push(layout.class_name(catch_type)?.to_string());
                    }
                }
                Some(MethodBody {
                    instructions: parse_bytecode(code, layout, &bootstrap_methods)
                        .with_context(|| format!("parse bytecode of {method_name}{descriptor}"))?,
                    catch_types,
                    local_signatures: Vec::new(),
                })
            }
            None => None,
        };
        methods.push(Method {
            name: method_name.to_string(),
            descriptor: descriptor.to_string(),
            access: MethodAccess::new(method.access_flags),
            signature: None,
            exceptions: Vec::new(),
            annotations: Vec::new(),
            body,
        });
    }

    Ok(Class {
        name,
        access_flags: layout.access_flags,
        super_name,
        interfaces,
        signature: None,
        outer_class: None,
        outer_method_descriptor: None,
        annotations: Vec::new(),
        fields,
        methods,
    })
}

fn parse_bytecode<P>(code: &[u8], pool: &P, bootstrap_methods: &[BootstrapMethod]) -> Result<Vec<Instruction>>
where
    P: ConstantLookup + ?Sized,
{
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let start_offset = offset as u32;
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let kind = match opcode {
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let method_index = read_u16(code, offset + 1)?;
                let (owner, name, descriptor) =
                    pool.member_ref(method_index).context("resolve method ref")?;
                let call_kind = match opcode {
                    opcodes::INVOKEVIRTUAL => CallKind::Virtual,
                    opcodes::INVOKESPECIAL => CallKind::Special,
                    opcodes::INVOKESTATIC => CallKind::Static,
                    _ => CallKind::Interface,
                };
                InstructionKind::Invoke(CallSite {
                    owner,
                    name,
                    descriptor,
                    kind: call_kind,
                    offset: start_offset,
                })
            }
            opcodes::INVOKEDYNAMIC => {
                let index = read_u16(code, offset + 1)?;
                let (bootstrap_index, name, descriptor) =
                    pool.invoke_dynamic(index).context("resolve invokedynamic")?;
                let bootstrap = bootstrap_methods
                    .get(bootstrap_index as usize)
                    .with_context(|| format!("missing bootstrap method {bootstrap_index}"))?;
                let mut arguments = Vec::with_capacity(bootstrap.arguments.len());
                for argument in &bootstrap.arguments {
                    arguments.push(pool.constant(*argument).context("resolve bootstrap argument")?);
                }
                InstructionKind::InvokeDynamic(DynamicCallSite {
                    name,
                    descriptor,
                    bootstrap: pool
                        .method_handle(bootstrap.method_ref)
                        .context("resolve bootstrap method")?,
                    arguments,
                })
            }
            opcodes::GETSTATIC | opcodes::PUTSTATIC | opcodes::GETFIELD | opcodes::PUTFIELD => {
                let field_index = read_u16(code, offset + 1)?;
                let (owner, name, descriptor) =
                    pool.member_ref(field_index).context("resolve field ref")?;
                InstructionKind::FieldAccess(FieldRef {
                    owner,
                    name,
                    descriptor,
                })
            }
            opcodes::NEW | opcodes::ANEWARRAY | opcodes::CHECKCAST | opcodes::INSTANCEOF => {
                let class_index = read_u16(code, offset + 1)?;
                let name = pool.type_name(class_index).context("resolve type operand")?;
                let op = match opcode {
                    opcodes::NEW => TypeOp::New,
                    opcodes::ANEWARRAY => TypeOp::NewArray,
                    opcodes::CHECKCAST => TypeOp::CheckCast,
                    _ => TypeOp::InstanceOf,
                };
                InstructionKind::Type(op, name)
            }
            opcodes::MULTIANEWARRAY => {
                let class_index = read_u16(code, offset + 1)?;
                let name = pool.type_name(class_index).context("resolve array type")?;
                InstructionKind::MultiNewArray(name)
            }
            opcodes::LDC | opcodes::LDC_W | opcodes::LDC2_W => {
                let index = if opcode == opcodes::LDC {
                    code.get(offset + 1).copied().context("ldc index")? as u16
                } else {
                    read_u16(code, offset + 1)?
                };
                match pool.constant(index).context("resolve ldc constant")? {
                    Constant::Other => InstructionKind::Other(opcode),
                    constant => InstructionKind::Constant(constant),
                }
            }
            _ => InstructionKind::Other(opcode),
        };

        instructions.push(Instruction {
            offset: start_offset,
            kind,
        });
        offset += length;
    }
    Ok(instructions)
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0x99..=0xa6 => 3,
        opcodes::GOTO | opcodes::JSR => 3,
        0xa9 => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        opcodes::GETSTATIC..=opcodes::PUTFIELD => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        opcodes::NEWARRAY => 2,
        opcodes::ANEWARRAY => 3,
        0xbe | 0xbf => 1,
        opcodes::CHECKCAST | opcodes::INSTANCEOF => 3,
        0xc2 | 0xc3 => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        opcodes::MULTIANEWARRAY => 4,
        0xc6 | 0xc7 => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        0xca => 1,
        0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == 0x84 { Ok(6) } else { Ok(4) }
}

fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}

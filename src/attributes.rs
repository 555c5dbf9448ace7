//! Constant pool resolution and attribute payloads over `jclassfile`'s decoded structures.

use anyhow::{Context, Result};
use jclassfile::attributes::{Annotation, Attribute, ElementValue, ExceptionRecord};
use jclassfile::constant_pool::ConstantPool;

use crate::classfile::{BootstrapMethod, ConstantLookup};
use crate::ir::{Constant, HandleKind, MethodHandle};

pub(crate) fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    match constant_pool.get(index as usize) {
        Some(ConstantPool::Utf8 { value }) => Ok(value.clone()),
        Some(_) => anyhow::bail!("constant {index} is not a utf8 entry"),
        None => anyhow::bail!("missing utf8 entry {index}"),
    }
}

pub(crate) fn resolve_class_name(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    match constant_pool.get(index as usize) {
        Some(ConstantPool::Class { name_index }) => resolve_utf8(constant_pool, *name_index),
        Some(_) => anyhow::bail!("constant {index} is not a class entry"),
        None => anyhow::bail!("missing class entry {index}"),
    }
}

fn resolve_name_and_type(constant_pool: &[ConstantPool], index: u16) -> Result<(String, String)> {
    match constant_pool.get(index as usize) {
        Some(ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        }) => Ok((
            resolve_utf8(constant_pool, *name_index)?,
            resolve_utf8(constant_pool, *descriptor_index)?,
        )),
        _ => anyhow::bail!("constant {index} is not a name and type entry"),
    }
}

impl ConstantLookup for [ConstantPool] {
    fn type_name(&self, index: u16) -> Result<String> {
        resolve_class_name(self, index)
    }

    fn member_ref(&self, index: u16) -> Result<(String, String, String)> {
        match self.get(index as usize) {
            Some(
                ConstantPool::Fieldref {
                    class_index,
                    name_and_type_index,
                }
                | ConstantPool::Methodref {
                    class_index,
                    name_and_type_index,
                }
                | ConstantPool::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                },
            ) => {
                let owner = resolve_class_name(self, *class_index)?;
                let (name, descriptor) = resolve_name_and_type(self, *name_and_type_index)?;
                Ok((owner, name, descriptor))
            }
            _ => anyhow::bail!("constant {index} is not a member reference"),
        }
    }

    fn method_handle(&self, index: u16) -> Result<MethodHandle> {
        match self.get(index as usize) {
            Some(ConstantPool::MethodHandle {
                reference_kind,
                reference_index,
            }) => {
                let kind = HandleKind::from_tag(*reference_kind)
                    .with_context(|| format!("invalid method handle kind {reference_kind}"))?;
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
            .get(index as usize)
            .with_context(|| format!("missing constant {index}"))?;
        let constant = match entry {
            ConstantPool::String { string_index } => Constant::String(resolve_utf8(self, *string_index)?),
            ConstantPool::Class { name_index } => Constant::Class(resolve_utf8(self, *name_index)?),
            ConstantPool::MethodType { descriptor_index } => {
                Constant::MethodType(resolve_utf8(self, *descriptor_index)?)
            }
            ConstantPool::MethodHandle { .. } => Constant::MethodHandle(self.method_handle(index)?),
            _ => Constant::Other,
        };
        Ok(constant)
    }

    fn invoke_dynamic(&self, index: u16) -> Result<(u16, String, String)> {
        match self.get(index as usize) {
            Some(ConstantPool::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            }) => {
                let (name, descriptor) = resolve_name_and_type(self, *name_and_type_index)?;
                Ok((*bootstrap_method_attr_index, name, descriptor))
            }
            _ => anyhow::bail!("constant {index} is not an invokedynamic entry"),
        }
    }
}

pub(crate) fn signature(constant_pool: &[ConstantPool], attributes: &[Attribute]) -> Result<Option<String>> {
    attributes
        .iter()
        .find_map(|attribute| match attribute {
            Attribute::Signature { signature_index } => Some(*signature_index),
            _ => None,
        })
        .map(|index| resolve_utf8(constant_pool, index).context("resolve signature"))
        .transpose()
}

/// Checked exception class names declared by a method.
pub(crate) fn exceptions(constant_pool: &[ConstantPool], attributes: &[Attribute]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for attribute in attributes {
        let Attribute::Exceptions {
            exception_index_table,
        } = attribute
        else {
            continue;
        };
        for index in exception_index_table {
            names.push(resolve_class_name(constant_pool, *index).context("resolve declared exception")?);
        }
    }
    Ok(names)
}

/// Enclosing class and, when present, the enclosing method descriptor.
pub(crate) fn enclosing_method(
    constant_pool: &[ConstantPool],
    attributes: &[Attribute],
) -> Result<Option<(String, Option<String>)>> {
    for attribute in attributes {
        let Attribute::EnclosingMethod {
            class_index,
            method_index,
        } = attribute
        else {
            continue;
        };
        let owner = resolve_class_name(constant_pool, *class_index).context("resolve enclosing class")?;
        let descriptor = if *method_index == 0 {
            None
        } else {
            Some(resolve_name_and_type(constant_pool, *method_index)?.1)
        };
        return Ok(Some((owner, descriptor)));
    }
    Ok(None)
}

pub(crate) fn bootstrap_methods(attributes: &[Attribute]) -> Vec<BootstrapMethod> {
    attributes
        .iter()
        .filter_map(|attribute| match attribute {
            Attribute::BootstrapMethods { bootstrap_methods } => Some(bootstrap_methods),
            _ => None,
        })
        .flatten()
        .map(|record| BootstrapMethod {
            method_ref: record.bootstrap_method_ref(),
            arguments: record.bootstrap_arguments().clone(),
        })
        .collect()
}

/// Bytecode, exception table and nested attributes of a method's Code attribute.
pub(crate) fn code(attributes: &[Attribute]) -> Option<(&[u8], &[ExceptionRecord], &[Attribute])> {
    attributes.iter().find_map(|attribute| match attribute {
        Attribute::Code {
            code,
            exception_table,
            attributes,
            ..
        } => Some((code.as_slice(), exception_table.as_slice(), attributes.as_slice())),
        _ => None,
    })
}

/// Class names caught by the exception table; `catch_type` 0 is a finally block.
pub(crate) fn catch_types(constant_pool: &[ConstantPool], exception_table: &[ExceptionRecord]) -> Result<Vec<String>> {
    exception_table
        .iter()
        .filter(|record| record.catch_type() != 0)
        .map(|record| resolve_class_name(constant_pool, record.catch_type()).context("resolve catch type"))
        .collect()
}

/// Generic signatures from a LocalVariableTypeTable nested in a Code attribute.
pub(crate) fn local_variable_signatures(
    constant_pool: &[ConstantPool],
    code_attributes: &[Attribute],
) -> Result<Vec<String>> {
    let mut signatures = Vec::new();
    for attribute in code_attributes {
        let Attribute::LocalVariableTypeTable {
            local_variable_type_table,
        } = attribute
        else {
            continue;
        };
        for record in local_variable_type_table {
            signatures.push(resolve_utf8(constant_pool, record.signature_index())?);
        }
    }
    Ok(signatures)
}

/// Field descriptors referenced from annotation payloads: annotation types, enum
/// constant types, class literals and nested annotations.
pub(crate) fn annotation_descriptors(
    constant_pool: &[ConstantPool],
    attributes: &[Attribute],
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for attribute in attributes {
        match attribute {
            Attribute::RuntimeVisibleAnnotations { annotations, .. }
            | Attribute::RuntimeInvisibleAnnotations { annotations } => {
                for annotation in annotations {
                    collect_annotation(constant_pool, annotation, &mut out)?;
                }
            }
            Attribute::RuntimeVisibleParameterAnnotations {
                parameter_annotations,
            } => {
                for annotation in parameter_annotations.iter().flatten() {
                    collect_annotation(constant_pool, annotation, &mut out)?;
                }
            }
            Attribute::RuntimeVisibleTypeAnnotations { type_annotations } => {
                for type_annotation in type_annotations {
                    collect_annotation(constant_pool, type_annotation.annotation(), &mut out)?;
                }
            }
            Attribute::AnnotationDefault { default_value, .. } => {
                collect_element_value(constant_pool, default_value, &mut out)?;
            }
            _ => {}
        }
    }
    Ok(out)
}

fn collect_annotation(constant_pool: &[ConstantPool], annotation: &Annotation, out: &mut Vec<String>) -> Result<()> {
    out.push(resolve_utf8(constant_pool, annotation.type_index()).context("resolve annotation type")?);
    for pair in annotation.element_value_pairs() {
        collect_element_value(constant_pool, pair.value(), out)?;
    }
    Ok(())
}

fn collect_element_value(constant_pool: &[ConstantPool], value: &ElementValue, out: &mut Vec<String>) -> Result<()> {
    match value {
        ElementValue::ConstValueIndex { .. } => {}
        ElementValue::EnumConstValue { type_name_index, .. } => {
            out.push(resolve_utf8(constant_pool, *type_name_index)?);
        }
        ElementValue::ClassInfoIndex { class_info_index, .. } => {
            out.push(resolve_utf8(constant_pool, *class_info_index)?);
        }
        ElementValue::AnnotationValue { annotation_value, .. } => {
            collect_annotation(constant_pool, annotation_value, out)?;
        }
        ElementValue::ArrayValue { values, .. } => {
            for element in values {
                collect_element_value(constant_pool, element, out)?;
            }
        }
    }
    Ok(())
}

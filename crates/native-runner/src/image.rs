// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Program loading from relocatable object files
//!
//! # Sections
//!
//! | Section | Contents |
//! |---------|----------|
//! | `.text` | machine code; defined symbols are entry points |
//! | `.rodata` | read-only data |
//! | `.globals` | initial globals |
//! | `.data` | initial linear memory |
//! | `.unwind` | call-site records: `u32` return offset, `u32` function, `u32` frame size |
//!
//! Function indices in `.unwind` refer to text symbols in address order.
//!
//! # Relocations
//!
//! Only two kinds are accepted in `.text`: 64-bit absolute references to
//! undefined symbols, resolved through the host import table, and 32-bit
//! absolute references into `.rodata`, patched when a runner maps the program.

use object::{
    Architecture, Object, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget,
    SymbolKind,
};
use runtime::{
    resolve_import, round_up, CallSite, Program, RoDataFixup, RuntimeError, UnwindMap, PAGE_SIZE,
};
use thiserror::Error;
use tracing::debug;

const UNWIND_RECORD_SIZE: usize = 12;

/// Errors raised while loading a program image
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to parse object file: {0}")]
    Parse(#[from] object::Error),

    #[error("object file targets {found:?}, this host runs {expected:?}")]
    Architecture {
        expected: Architecture,
        found: Architecture,
    },

    #[error("object file has no .text section")]
    MissingText,

    #[error("{section} is {size} bytes, limit is {limit}")]
    TooLarge {
        section: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("unresolved import: {symbol}")]
    UnresolvedImport { symbol: String },

    #[error("unsupported relocation at .text+{offset:#x}: {reason}")]
    UnsupportedRelocation { offset: u64, reason: String },

    #[error(".unwind is {size} bytes, not a multiple of 12")]
    MalformedUnwind { size: usize },

    #[error(transparent)]
    Program(#[from] RuntimeError),
}

/// Limits and entry selection for loading
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub text_size: usize,
    pub ro_data_size: usize,
    pub entry: String,
}

/// Architecture of objects this host can execute
pub fn host_architecture() -> Architecture {
    if cfg!(target_arch = "aarch64") {
        Architecture::Aarch64
    } else {
        Architecture::X86_64
    }
}

/// Build a program from the bytes of an object file
pub fn load(bytes: &[u8], options: &LoadOptions) -> Result<Program, ImageError> {
    let file = object::File::parse(bytes)?;
    if file.architecture() != host_architecture() {
        return Err(ImageError::Architecture {
            expected: host_architecture(),
            found: file.architecture(),
        });
    }

    let text = file.section_by_name(".text").ok_or(ImageError::MissingText)?;
    let mut code = text.data()?.to_vec();
    check_size(".text", code.len(), options.text_size)?;

    let rodata = file.section_by_name(".rodata");
    let ro_data = match &rodata {
        Some(section) => section.data()?.to_vec(),
        None => Vec::new(),
    };
    check_size(".rodata", ro_data.len(), options.ro_data_size)?;

    let globals = section_bytes(&file, ".globals")?;
    let data = section_bytes(&file, ".data")?;
    let memory_offset = round_up(globals.len(), PAGE_SIZE);

    let mut functions: Vec<(u64, String)> = file
        .symbols()
        .filter(|s| s.section_index() == Some(text.index()) && s.is_definition())
        .filter(|s| s.kind() == SymbolKind::Text)
        .filter_map(|s| Some((s.address() - text.address(), s.name().ok()?.to_string())))
        .filter(|(_, name)| !name.is_empty())
        .collect();
    functions.sort();

    let rodata_index = rodata.as_ref().map(|s| s.index());
    let mut ro_data_fixups = Vec::new();
    for (offset, relocation) in text.relocations() {
        match (relocation.kind(), relocation.size()) {
            (RelocationKind::Absolute, 64) => {
                let symbol = target_symbol(&file, offset, relocation.target())?;
                if !symbol.is_undefined() {
                    return Err(unsupported(offset, "64-bit reference to a defined symbol"));
                }
                let name = symbol.name()?;
                let address = resolve_import(name).ok_or_else(|| ImageError::UnresolvedImport {
                    symbol: name.to_string(),
                })?;
                let value = (address as u64).wrapping_add(relocation.addend() as u64);
                debug!(import = name, offset, "resolved import");
                patch(&mut code, offset, &value.to_le_bytes())?;
            }
            (RelocationKind::Absolute, 32) => {
                let symbol = target_symbol(&file, offset, relocation.target())?;
                if rodata_index.is_none() || symbol.section_index() != rodata_index {
                    return Err(unsupported(offset, "32-bit reference outside .rodata"));
                }
                let implicit = if relocation.has_implicit_addend() {
                    read_u32(&code, offset)? as i64
                } else {
                    0
                };
                let addend = symbol.address() as i64 + relocation.addend() + implicit;
                let addend = u32::try_from(addend)
                    .map_err(|_| unsupported(offset, "read-only data addend out of range"))?;
                ro_data_fixups.push(RoDataFixup {
                    code_offset: offset as u32,
                    addend,
                });
            }
            (kind, size) => {
                return Err(unsupported(offset, format!("{kind:?} relocation of {size} bits")));
            }
        }
    }

    let unwind = parse_unwind(&section_bytes(&file, ".unwind")?)?
        .with_function_names(functions.iter().map(|(_, name)| name.clone()).collect());
    if unwind.is_empty() && functions.len() > 1 {
        debug!("no .unwind records, only entry frames can be walked");
    }

    debug!(
        code = code.len(),
        ro_data = ro_data.len(),
        globals = globals.len(),
        data = data.len(),
        functions = functions.len(),
        call_sites = unwind.len(),
        "loaded program image"
    );

    let program = Program::builder(code)
        .entry_points(
            functions
                .into_iter()
                .map(|(offset, name)| (name, offset as u32))
                .collect(),
        )
        .entry(options.entry.clone())
        .ro_data(ro_data, ro_data_fixups)
        .globals(globals, memory_offset)
        .data(data)
        .unwind(unwind)
        .build()?;
    Ok(program)
}

fn check_size(section: &'static str, size: usize, limit: usize) -> Result<(), ImageError> {
    if size > limit {
        return Err(ImageError::TooLarge {
            section,
            size,
            limit,
        });
    }
    Ok(())
}

fn section_bytes(file: &object::File<'_>, name: &str) -> Result<Vec<u8>, ImageError> {
    match file.section_by_name(name) {
        Some(section) => Ok(section.data()?.to_vec()),
        None => Ok(Vec::new()),
    }
}

fn target_symbol<'data, 'file>(
    file: &'file object::File<'data>,
    offset: u64,
    target: RelocationTarget,
) -> Result<object::Symbol<'data, 'file>, ImageError> {
    match target {
        RelocationTarget::Symbol(index) => Ok(file.symbol_by_index(index)?),
        _ => Err(unsupported(offset, "relocation target is not a symbol")),
    }
}

fn unsupported(offset: u64, reason: impl Into<String>) -> ImageError {
    ImageError::UnsupportedRelocation {
        offset,
        reason: reason.into(),
    }
}

fn patch(code: &mut [u8], offset: u64, bytes: &[u8]) -> Result<(), ImageError> {
    let start = offset as usize;
    code.get_mut(start..start + bytes.len())
        .ok_or_else(|| unsupported(offset, "relocation outside .text"))?
        .copy_from_slice(bytes);
    Ok(())
}

fn read_u32(code: &[u8], offset: u64) -> Result<u32, ImageError> {
    let start = offset as usize;
    let bytes = code
        .get(start..start + 4)
        .ok_or_else(|| unsupported(offset, "relocation outside .text"))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_unwind(bytes: &[u8]) -> Result<UnwindMap, ImageError> {
    if bytes.len() % UNWIND_RECORD_SIZE != 0 {
        return Err(ImageError::MalformedUnwind { size: bytes.len() });
    }
    let mut map = UnwindMap::new();
    for record in bytes.chunks_exact(UNWIND_RECORD_SIZE) {
        let field = |i: usize| {
            u32::from_le_bytes([record[i], record[i + 1], record[i + 2], record[i + 3]])
        };
        map.insert(
            field(0),
            CallSite {
                function: field(4),
                frame_size: field(8),
            },
        );
    }
    Ok(map)
}

//! oiSH: a shader container holding entrypoints, per-target compiled
//! binaries, and reflection metadata (C8).
//!
//! This is the structurally richest format; write is reconstructed as the
//! mirror of `original_source/src/formats/oiSH/read.c` (only the read side
//! was retrieved). The fixed header carries seven entry-count fields plus a
//! `sizeTypes` byte (two bits per [`BinaryType`], selecting the minimal
//! [`SizeType`] each binary's blob length is encoded with). Layout after the
//! fixed header (`spec.md` §4.8):
//!
//! ```text
//! [embedded oiDL of strings: uniform names, uniform values, register names,
//!  include paths, entrypoint names, semantic names]
//! [embedded oiDL of bytes: SBFile buffer-layout blobs]
//! [BinaryInfoFixedSize x binaryCount] [EntryInfoFixedSize x stageCount]
//! [include CRC32C table] [array-dim scratch]
//! [per-binary variable payload] [per-entrypoint variable payload]
//! ```

use std::collections::BTreeMap;

use crate::crc32c;
use crate::error::{OxError, OxResult};
use crate::formats::oidl::{DLEntries, DLFile, DLSettings};
use crate::size::{decode_version, encode_version, Cursor, SizeType, Writer};

pub const MAGIC: u32 = 0x4853_696F;
const SENTINEL_U16: u16 = 0xFFFF;

/// Number of [`PipelineStage`] variants — a fixed binary's stage byte at or
/// above this is "no stage" (only valid alongside `hasShaderAnnotation`),
/// matching `original_source/.../oiSH/read.c`'s `entrypointType >=
/// ESHPipelineStage_Count` check.
const PIPELINE_STAGE_COUNT: u8 = 15;
const STAGE_SENTINEL: u8 = 0xFF;

const FLAG_IS_UTF8: u8 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BinaryType {
    SpirV = 0,
    Dxil = 1,
}

impl BinaryType {
    const ALL: [BinaryType; 2] = [BinaryType::SpirV, BinaryType::Dxil];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Vertex,
    Fragment,
    Geometry,
    Hull,
    Domain,
    Compute,
    MeshExt,
    TaskExt,
    WorkgraphExt,
    RaygenExt,
    CallableExt,
    ClosestHitExt,
    AnyHitExt,
    MissExt,
    IntersectionExt,
}

impl PipelineStage {
    fn code(self) -> u8 {
        match self {
            PipelineStage::Vertex => 0,
            PipelineStage::Fragment => 1,
            PipelineStage::Geometry => 2,
            PipelineStage::Hull => 3,
            PipelineStage::Domain => 4,
            PipelineStage::Compute => 5,
            PipelineStage::MeshExt => 6,
            PipelineStage::TaskExt => 7,
            PipelineStage::WorkgraphExt => 8,
            PipelineStage::RaygenExt => 9,
            PipelineStage::CallableExt => 10,
            PipelineStage::ClosestHitExt => 11,
            PipelineStage::AnyHitExt => 12,
            PipelineStage::MissExt => 13,
            PipelineStage::IntersectionExt => 14,
        }
    }

    fn from_code(code: u8) -> OxResult<Self> {
        Ok(match code {
            0 => PipelineStage::Vertex,
            1 => PipelineStage::Fragment,
            2 => PipelineStage::Geometry,
            3 => PipelineStage::Hull,
            4 => PipelineStage::Domain,
            5 => PipelineStage::Compute,
            6 => PipelineStage::MeshExt,
            7 => PipelineStage::TaskExt,
            8 => PipelineStage::WorkgraphExt,
            9 => PipelineStage::RaygenExt,
            10 => PipelineStage::CallableExt,
            11 => PipelineStage::ClosestHitExt,
            12 => PipelineStage::AnyHitExt,
            13 => PipelineStage::MissExt,
            14 => PipelineStage::IntersectionExt,
            other => return Err(OxError::InvalidParameter(format!("unknown pipeline stage {other}"))),
        })
    }

    /// Graphics stages carry an i/o attribute table (`spec.md` §4.8). `Mesh`
    /// and `Task` carry both this and the compute group-dims block — the
    /// original's `default:` switch case falls through into the compute
    /// case for exactly those two stages.
    fn is_graphics(self) -> bool {
        matches!(
            self,
            PipelineStage::Vertex
                | PipelineStage::Fragment
                | PipelineStage::Geometry
                | PipelineStage::Hull
                | PipelineStage::Domain
                | PipelineStage::MeshExt
                | PipelineStage::TaskExt
        )
    }

    fn has_group_dims(self) -> bool {
        matches!(
            self,
            PipelineStage::Compute | PipelineStage::WorkgraphExt | PipelineStage::MeshExt | PipelineStage::TaskExt
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SHRegister {
    pub register_type: u8,
    /// Per-dimension element counts, each in `[1, 32]` element-count range
    /// isn't the constraint — the dimension *count* (`array_dims.len()`)
    /// must be in `[1, 32]` (`spec.md` §4.8 array-dim scratch).
    pub array_dims: Option<Vec<u32>>,
    pub name: String,
    pub buffer_layout: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SHBinaryIdentifier {
    pub stage: Option<PipelineStage>,
    pub shader_major: u8,
    pub shader_minor: u8,
    pub entrypoint: Option<String>,
    pub extensions: u32,
    pub uniforms: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SHBinaryInfo {
    pub identifier: SHBinaryIdentifier,
    pub vendor_mask: u8,
    pub has_shader_annotation: bool,
    pub registers: Vec<SHRegister>,
    pub binaries: BTreeMap<BinaryType, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SHEntry {
    pub stage: Option<PipelineStage>,
    pub name: String,
    pub inputs: Vec<u8>,
    pub outputs: Vec<u8>,
    pub unique_input_semantics: u8,
    pub input_semantic_refs: Vec<u8>,
    pub output_semantic_refs: Vec<u8>,
    pub semantic_names: Vec<String>,
    pub group_x: u16,
    pub group_y: u16,
    pub group_z: u16,
    pub wave_size: u16,
    pub intersection_size: Option<u8>,
    pub payload_size: Option<u8>,
    pub binary_ids: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SHInclude {
    pub relative_path: String,
    pub crc32c: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SHSettings {
    pub is_utf8: bool,
}

#[derive(Debug, Clone)]
pub struct SHFile {
    pub settings: SHSettings,
    pub compiler_version: u32,
    pub source_hash: u32,
    pub binaries: Vec<SHBinaryInfo>,
    pub entries: Vec<SHEntry>,
    pub includes: Vec<SHInclude>,
    pub read_length: usize,
}

impl SHFile {
    pub fn new(settings: SHSettings, compiler_version: u32, source_hash: u32) -> Self {
        Self {
            settings,
            compiler_version,
            source_hash,
            binaries: Vec::new(),
            entries: Vec::new(),
            includes: Vec::new(),
            read_length: 0,
        }
    }

    fn validate(&self) -> OxResult<()> {
        for i in 0..self.entries.len() {
            for j in (i + 1)..self.entries.len() {
                if self.entries[i].name == self.entries[j].name {
                    return Err(OxError::AlreadyDefined(format!(
                        "duplicate entrypoint name {}",
                        self.entries[i].name
                    )));
                }
            }
        }
        for (j, binary) in self.binaries.iter().enumerate() {
            let referenced = self
                .entries
                .iter()
                .any(|e| e.binary_ids.iter().any(|&id| id as usize == j));
            if binary.has_shader_annotation {
                if !referenced {
                    return Err(OxError::InvalidState(format!(
                        "binary {j} marked as shader annotation but referenced by no entrypoint"
                    )));
                }
            } else {
                let entry = self
                    .entries
                    .iter()
                    .find(|e| e.name.as_str() == binary.identifier.entrypoint.as_deref().unwrap_or(""));
                match entry {
                    Some(e) if e.binary_ids.iter().any(|&id| id as usize == j) => {}
                    _ => {
                        return Err(OxError::InvalidState(format!(
                            "binary {j} declares entrypoint {:?} but that entrypoint doesn't reference it",
                            binary.identifier.entrypoint
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Merges `other` into `self`, de-duplicating binaries by identifier
    /// equality and failing on a name-colliding entrypoint with different
    /// metadata (`spec.md` §4.8 Combine).
    pub fn combine(a: &SHFile, b: &SHFile) -> OxResult<SHFile> {
        let mut out = a.clone();
        for binary in &b.binaries {
            if !out.binaries.iter().any(|existing| existing.identifier == binary.identifier) {
                out.binaries.push(binary.clone());
            }
        }
        for entry in &b.entries {
            if let Some(existing) = out.entries.iter().find(|e| e.name == entry.name) {
                if existing != entry {
                    return Err(OxError::AlreadyDefined(format!(
                        "entrypoint {} already declared with different metadata",
                        entry.name
                    )));
                }
            } else {
                out.entries.push(entry.clone());
            }
        }
        for include in &b.includes {
            if !out.includes.iter().any(|e| e.relative_path == include.relative_path) {
                out.includes.push(include.clone());
            }
        }
        Ok(out)
    }

    pub fn write(&self, hide_magic_number: bool) -> OxResult<Vec<u8>> {
        self.validate()?;

        let mut uniform_names: Vec<String> = Vec::new();
        let mut uniform_values: Vec<String> = Vec::new();
        for b in &self.binaries {
            for (name, _) in &b.identifier.uniforms {
                if !uniform_names.contains(name) {
                    uniform_names.push(name.clone());
                }
            }
        }
        for b in &self.binaries {
            for (_, value) in &b.identifier.uniforms {
                if !uniform_values.contains(value) {
                    uniform_values.push(value.clone());
                }
            }
        }

        let mut register_names: Vec<String> = Vec::new();
        for b in &self.binaries {
            for r in &b.registers {
                if !register_names.contains(&r.name) {
                    register_names.push(r.name.clone());
                }
            }
        }

        let include_paths: Vec<String> = self.includes.iter().map(|i| i.relative_path.clone()).collect();
        let entrypoint_names: Vec<String> = self.entries.iter().map(|e| e.name.clone()).collect();

        let mut semantic_names: Vec<String> = Vec::new();
        for e in &self.entries {
            for s in &e.semantic_names {
                if !semantic_names.contains(s) {
                    semantic_names.push(s.clone());
                }
            }
        }

        let mut all_strings = Vec::new();
        all_strings.extend(uniform_names.iter().cloned());
        all_strings.extend(uniform_values.iter().cloned());
        all_strings.extend(register_names.iter().cloned());
        all_strings.extend(include_paths.iter().cloned());
        all_strings.extend(entrypoint_names.iter().cloned());
        all_strings.extend(semantic_names.iter().cloned());

        let string_entries = if self.settings.is_utf8 {
            DLEntries::Utf8(all_strings)
        } else {
            DLEntries::Ascii(all_strings)
        };
        let strings_dl = DLFile::new(
            DLSettings {
                data_type: if self.settings.is_utf8 {
                    crate::formats::oidl::DataType::Utf8
                } else {
                    crate::formats::oidl::DataType::Ascii
                },
                ..Default::default()
            },
            string_entries,
        );
        let strings_bytes = strings_dl.write(true)?;

        let mut buffer_table: Vec<Vec<u8>> = Vec::new();
        let buffer_index = |table: &mut Vec<Vec<u8>>, blob: &[u8]| -> u16 {
            if let Some(i) = table.iter().position(|b| b == blob) {
                return i as u16;
            }
            table.push(blob.to_vec());
            (table.len() - 1) as u16
        };
        let mut register_buffer_ids: Vec<Vec<Option<u16>>> = Vec::with_capacity(self.binaries.len());
        for b in &self.binaries {
            let mut ids = Vec::with_capacity(b.registers.len());
            for r in &b.registers {
                ids.push(r.buffer_layout.as_ref().map(|blob| buffer_index(&mut buffer_table, blob)));
            }
            register_buffer_ids.push(ids);
        }
        let buffers_dl = DLFile::new(DLSettings::default(), DLEntries::Data(buffer_table));
        let buffers_bytes = buffers_dl.write(true)?;

        let mut array_dim_table: Vec<Vec<u32>> = Vec::new();
        let array_index = |table: &mut Vec<Vec<u32>>, dims: &[u32]| -> OxResult<u16> {
            if dims.is_empty() || dims.len() > 32 {
                return Err(OxError::InvalidParameter("array dimension count must be in [1,32]".into()));
            }
            if let Some(i) = table.iter().position(|d| d == dims) {
                return Ok(i as u16);
            }
            table.push(dims.to_vec());
            Ok((table.len() - 1) as u16)
        };
        let mut register_array_ids: Vec<Vec<Option<u16>>> = Vec::with_capacity(self.binaries.len());
        for b in &self.binaries {
            let mut ids = Vec::with_capacity(b.registers.len());
            for r in &b.registers {
                ids.push(match &r.array_dims {
                    Some(d) => Some(array_index(&mut array_dim_table, d)?),
                    None => None,
                });
            }
            register_array_ids.push(ids);
        }

        let binary_count = self.binaries.len();
        let stage_count = self.entries.len();
        if binary_count > u16::MAX as usize || stage_count > u16::MAX as usize {
            return Err(OxError::OutOfBounds("too many binaries or entrypoints".into()));
        }

        // Minimal SizeType per binary type, packed 2 bits each into the
        // header's `sizeTypes` byte (`spec.md` §3/§4.8; `original_source`
        // reads each blob length via `(header.sizeTypes >> (i<<1)) & 3`).
        let mut binary_type_max_len: BTreeMap<BinaryType, u64> = BTreeMap::new();
        for b in &self.binaries {
            for (bt, data) in &b.binaries {
                let max_len = binary_type_max_len.entry(*bt).or_insert(0);
                *max_len = (*max_len).max(data.len() as u64);
            }
        }
        let binary_size_type =
            |bt: BinaryType| SizeType::required_for(*binary_type_max_len.get(&bt).unwrap_or(&0));
        let mut size_types_byte = 0u8;
        for bt in BinaryType::ALL {
            size_types_byte |= binary_size_type(bt).code() << ((bt as u8) * 2);
        }

        let mut fixed_binary = Writer::new();
        let mut var_binary = Writer::new();
        for (j, b) in self.binaries.iter().enumerate() {
            let mut binary_flags = 0u8;
            if b.has_shader_annotation {
                binary_flags |= 1;
            }
            for bt in BinaryType::ALL {
                if b.binaries.contains_key(&bt) {
                    binary_flags |= bt.bit() << 1;
                }
            }

            let entrypoint_id: u16 = if b.has_shader_annotation {
                SENTINEL_U16
            } else {
                let name = b.identifier.entrypoint.as_ref().ok_or_else(|| {
                    OxError::InvalidParameter(format!("binary {j} has no entrypoint and no shader annotation"))
                })?;
                entrypoint_names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| OxError::InvalidState(format!("binary {j} entrypoint {name} not found")))?
                    as u16
            };

            let stage_byte = match b.identifier.stage {
                Some(s) => s.code(),
                None => {
                    if !b.has_shader_annotation {
                        return Err(OxError::InvalidParameter(format!(
                            "binary {j} has no stage and no shader annotation"
                        )));
                    }
                    STAGE_SENTINEL
                }
            };

            if b.identifier.shader_major > 0xF || b.identifier.shader_minor > 0xF {
                return Err(OxError::InvalidParameter(format!(
                    "binary {j} shader model {}.{} doesn't fit the packed nibble pair",
                    b.identifier.shader_major, b.identifier.shader_minor
                )));
            }
            let shader_model_byte = (b.identifier.shader_major << 4) | (b.identifier.shader_minor & 0xF);

            fixed_binary.put_u32(b.identifier.extensions);
            fixed_binary.put_u8(shader_model_byte);
            fixed_binary.put_u8(stage_byte);
            fixed_binary.put_u16(entrypoint_id);
            fixed_binary.put_u8(b.vendor_mask);
            fixed_binary.put_u8(binary_flags);
            fixed_binary.put_u16(b.identifier.uniforms.len() as u16);
            fixed_binary.put_u16(b.registers.len() as u16);

            for (name, _) in &b.identifier.uniforms {
                let idx = uniform_names.iter().position(|n| n == name).unwrap() as u16;
                var_binary.put_u16(idx);
            }
            for (_, value) in &b.identifier.uniforms {
                let idx = uniform_values.iter().position(|v| v == value).unwrap() as u16;
                var_binary.put_u16(idx);
            }
            for (i, r) in b.registers.iter().enumerate() {
                var_binary.put_u8(r.register_type);
                var_binary.put_u16(register_array_ids[j][i].unwrap_or(SENTINEL_U16));
                let name_idx = register_names.iter().position(|n| n == &r.name).unwrap() as u16;
                var_binary.put_u16(name_idx);
                var_binary.put_u16(register_buffer_ids[j][i].unwrap_or(SENTINEL_U16));
            }
            for bt in BinaryType::ALL {
                if let Some(data) = b.binaries.get(&bt) {
                    var_binary.put_size(binary_size_type(bt), data.len() as u64)?;
                    var_binary.put_bytes(data);
                }
            }
        }

        let mut fixed_entry = Writer::new();
        let mut var_entry = Writer::new();

        for e in &self.entries {
            let stage = e.stage.ok_or_else(|| OxError::InvalidParameter("entrypoint has no stage".into()))?;
            if e.binary_ids.is_empty() {
                return Err(OxError::InvalidParameter(format!("entrypoint {} has no binaries", e.name)));
            }
            fixed_entry.put_u8(stage.code());
            fixed_entry.put_u8(e.binary_ids.len() as u8);

            if stage.is_graphics() {
                if e.inputs.len() > 0x7F || e.outputs.len() > 0x10 || e.inputs.len() > 0x10 {
                    return Err(OxError::InvalidParameter("too many graphics i/o attributes".into()));
                }
                let has_semantics = !e.semantic_names.is_empty();
                var_entry.put_u8((e.inputs.len() as u8) | if has_semantics { 0x80 } else { 0 });
                var_entry.put_u8(e.outputs.len() as u8);
                var_entry.put_bytes(&e.inputs);
                var_entry.put_bytes(&e.outputs);
                if has_semantics {
                    let unique_out = (e.semantic_names.len() as u8) - e.unique_input_semantics;
                    var_entry.put_u8(e.unique_input_semantics | (unique_out << 4));
                    var_entry.put_bytes(&e.input_semantic_refs);
                    var_entry.put_bytes(&e.output_semantic_refs);
                }
            }
            if stage.has_group_dims() {
                if e.wave_size != 0 && matches!(stage, PipelineStage::MeshExt | PipelineStage::TaskExt) {
                    return Err(OxError::InvalidParameter("waveSize isn't supported by mesh or task shaders".into()));
                }
                for nibble_shift in (0..4).map(|i| i * 4) {
                    let nibble = (e.wave_size >> nibble_shift) & 0xF;
                    if nibble == 1 || nibble == 2 || nibble > 8 {
                        return Err(OxError::InvalidParameter("waveSize nibble out of range".into()));
                    }
                }
                var_entry.put_u16(e.group_x);
                var_entry.put_u16(e.group_y);
                var_entry.put_u16(e.group_z);
                var_entry.put_u16(e.wave_size);
            }
            match stage {
                PipelineStage::RaygenExt | PipelineStage::CallableExt => {}
                PipelineStage::ClosestHitExt | PipelineStage::AnyHitExt | PipelineStage::IntersectionExt => {
                    var_entry.put_u8(e.intersection_size.unwrap_or(0));
                    var_entry.put_u8(e.payload_size.unwrap_or(0));
                }
                PipelineStage::MissExt => {
                    var_entry.put_u8(e.payload_size.unwrap_or(0));
                }
                _ => {}
            }
            for &id in &e.binary_ids {
                if id as usize >= binary_count {
                    return Err(OxError::OutOfBounds(format!("binary id {id} out of range")));
                }
                var_entry.put_u16(id);
            }
        }

        let mut include_table = Writer::new();
        for i in &self.includes {
            include_table.put_u32(i.crc32c);
        }

        let mut array_scratch = Writer::new();
        for dims in &array_dim_table {
            array_scratch.put_u8(dims.len() as u8);
        }
        for dims in &array_dim_table {
            for d in dims {
                array_scratch.put_u32(*d);
            }
        }

        let mut body = Writer::new();
        body.put_bytes(&strings_bytes);
        body.put_bytes(&buffers_bytes);
        body.put_bytes(&fixed_binary.buf);
        body.put_bytes(&fixed_entry.buf);
        body.put_bytes(&include_table.buf);
        body.put_bytes(&array_scratch.buf);
        body.put_bytes(&var_binary.buf);
        body.put_bytes(&var_entry.buf);

        let mut header = Writer::new();
        if !hide_magic_number {
            header.put_u32(MAGIC);
        }
        header.put_u8(encode_version(1, 2)?);
        let mut flags = 0u8;
        if self.settings.is_utf8 {
            flags |= FLAG_IS_UTF8;
        }
        header.put_u8(flags);
        let hash_slot = header.len();
        header.put_u32(0); // content CRC32C over everything from here on, patched below
        header.put_u32(self.compiler_version);
        header.put_u32(self.source_hash);
        header.put_u16(binary_count as u16);
        header.put_u16(stage_count as u16);
        header.put_u16(uniform_names.len() as u16);
        header.put_u16(semantic_names.len() as u16);
        header.put_u16(include_paths.len() as u16);
        header.put_u8(array_dim_table.len() as u8);
        header.put_u16(register_names.len() as u16);
        header.put_u8(size_types_byte);

        let mut full = header.buf;
        full.extend_from_slice(&body.buf);
        let hash_region_start = hash_slot + 4;
        let content_hash = crc32c::hash(&full[hash_region_start..]);
        full[hash_slot..hash_slot + 4].copy_from_slice(&content_hash.to_le_bytes());

        Ok(full)
    }

    pub fn read(buf: &[u8], is_sub_file: bool) -> OxResult<Self> {
        let mut cursor = Cursor::new(buf);

        if !is_sub_file {
            let magic = cursor.consume_u32()?;
            if magic != MAGIC {
                return Err(OxError::Unsupported(format!("bad oiSH magic number: {magic:#x}")));
            }
        }

        let version_byte = cursor.consume_u8()?;
        let (major, minor) = decode_version(version_byte);
        if (major, minor) != (1, 2) {
            return Err(OxError::Unsupported(format!("unsupported oiSH version {major}.{minor}")));
        }
        let flags = cursor.consume_u8()?;
        let is_utf8 = flags & FLAG_IS_UTF8 != 0;

        let stored_hash = cursor.consume_u32()?;
        let hash_region_start = cursor.offset();

        let compiler_version = cursor.consume_u32()?;
        let source_hash = cursor.consume_u32()?;

        let binary_count = cursor.consume_u16()? as usize;
        let stage_count = cursor.consume_u16()? as usize;
        if stage_count == 0 {
            return Err(OxError::InvalidParameter("oiSH must declare at least one entrypoint".into()));
        }
        let unique_uniforms = cursor.consume_u16()? as usize;
        let semantic_count = cursor.consume_u16()? as usize;
        let include_count = cursor.consume_u16()? as usize;
        let array_dim_count = cursor.consume_u8()? as usize;
        let register_name_count = cursor.consume_u16()? as usize;
        let binary_size_types = cursor.consume_u8()?;

        let computed_hash = crc32c::hash(&buf[hash_region_start..]);
        if computed_hash != stored_hash {
            return Err(OxError::Unauthorized("oiSH header CRC32C mismatch".into()));
        }

        let dl_input = &buf[cursor.offset()..];
        let strings = DLFile::read(dl_input, None, true)?;
        let min_entries = stage_count + include_count + semantic_count + register_name_count + unique_uniforms
            + if unique_uniforms > 0 { 1 } else { 0 };
        let all_strings: Vec<String> = match &strings.entries {
            DLEntries::Ascii(v) | DLEntries::Utf8(v) => v.clone(),
            DLEntries::Data(_) => return Err(OxError::InvalidParameter("oiSH strings must be ASCII/UTF8".into())),
        };
        if all_strings.len() < min_entries {
            return Err(OxError::InvalidParameter("oiSH strings didn't match expected counts".into()));
        }
        cursor.consume(strings.read_length)?;

        let buffers_input = &buf[cursor.offset()..];
        let buffers = DLFile::read(buffers_input, None, true)?;
        let buffer_table: Vec<Vec<u8>> = match &buffers.entries {
            DLEntries::Data(v) => v.clone(),
            _ => return Err(OxError::InvalidParameter("oiSH buffer blobs must be a data list".into())),
        };
        cursor.consume(buffers.read_length)?;

        struct FixedBinary {
            extensions: u32,
            shader_model_byte: u8,
            stage_byte: u8,
            entrypoint_id: u16,
            vendor_mask: u8,
            binary_flags: u8,
            uniform_count: u16,
            register_count: u16,
        }
        let mut fixed_binaries = Vec::with_capacity(binary_count);
        for _ in 0..binary_count {
            fixed_binaries.push(FixedBinary {
                extensions: cursor.consume_u32()?,
                shader_model_byte: cursor.consume_u8()?,
                stage_byte: cursor.consume_u8()?,
                entrypoint_id: cursor.consume_u16()?,
                vendor_mask: cursor.consume_u8()?,
                binary_flags: cursor.consume_u8()?,
                uniform_count: cursor.consume_u16()?,
                register_count: cursor.consume_u16()?,
            });
        }

        struct FixedEntry {
            stage: u8,
            binary_count: u8,
        }
        let mut fixed_entries = Vec::with_capacity(stage_count);
        for _ in 0..stage_count {
            fixed_entries.push(FixedEntry {
                stage: cursor.consume_u8()?,
                binary_count: cursor.consume_u8()?,
            });
        }

        let mut include_crc = Vec::with_capacity(include_count);
        for _ in 0..include_count {
            include_crc.push(cursor.consume_u32()?);
        }

        let mut array_dim_lengths = Vec::with_capacity(array_dim_count);
        for _ in 0..array_dim_count {
            let len = cursor.consume_u8()?;
            if len == 0 || len > 32 {
                return Err(OxError::InvalidState("array dimension length must be in [1,32]".into()));
            }
            array_dim_lengths.push(len as usize);
        }
        let mut array_dim_table = Vec::with_capacity(array_dim_count);
        for len in &array_dim_lengths {
            let mut dims = Vec::with_capacity(*len);
            for _ in 0..*len {
                dims.push(cursor.consume_u32()?);
            }
            array_dim_table.push(dims);
        }

        // The strings section is partitioned as: uniform names, uniform
        // values, register names, include paths, entrypoint names, semantic
        // names. Every boundary except the uniform-value/register-name one is
        // directly known from a header count, so walk in from both ends.
        let uniform_names_start = 0usize;
        let semantic_start = all_strings.len() - semantic_count;
        let entrypoint_start = semantic_start - stage_count;
        let include_start = entrypoint_start - include_count;
        let register_start = include_start - register_name_count;
        let uniform_value_start = unique_uniforms;
        let _ = uniform_names_start;

        let mut binaries = Vec::with_capacity(binary_count);
        for (j, fb) in fixed_binaries.iter().enumerate() {
            let has_annotation = fb.binary_flags & 1 != 0;
            let entrypoint = if fb.entrypoint_id != SENTINEL_U16 {
                if has_annotation {
                    return Err(OxError::InvalidState(format!(
                        "binary {j} has a shader annotation but entrypoint != sentinel"
                    )));
                }
                if fb.entrypoint_id as usize >= stage_count {
                    return Err(OxError::OutOfBounds(format!("binary {j} entrypoint id out of range")));
                }
                Some(all_strings[entrypoint_start + fb.entrypoint_id as usize].clone())
            } else {
                if !has_annotation {
                    return Err(OxError::InvalidState(format!(
                        "binary {j} has no entrypoint and no shader annotation"
                    )));
                }
                None
            };

            let mut uniforms = Vec::with_capacity(fb.uniform_count as usize);
            let mut name_ids = Vec::with_capacity(fb.uniform_count as usize);
            for _ in 0..fb.uniform_count {
                name_ids.push(cursor.consume_u16()?);
            }
            let mut value_ids = Vec::with_capacity(fb.uniform_count as usize);
            for _ in 0..fb.uniform_count {
                value_ids.push(cursor.consume_u16()?);
            }
            for i in 0..fb.uniform_count as usize {
                let name_id = name_ids[i];
                if name_id as usize >= unique_uniforms {
                    return Err(OxError::InvalidState("uniform name index out of bounds".into()));
                }
                let name = all_strings[uniform_names_start + name_id as usize].clone();
                let value_id = uniform_value_start + value_ids[i] as usize;
                if value_id >= register_start {
                    return Err(OxError::InvalidState("uniform value index out of bounds".into()));
                }
                let value = all_strings[value_id].clone();
                if uniforms.iter().any(|(existing_name, _)| existing_name == &name) {
                    return Err(OxError::AlreadyDefined(format!("uniform name {name} already declared")));
                }
                uniforms.push((name, value));
            }

            let mut registers = Vec::with_capacity(fb.register_count as usize);
            for _ in 0..fb.register_count {
                let register_type = cursor.consume_u8()?;
                let array_id = cursor.consume_u16()?;
                let name_id = cursor.consume_u16()?;
                let buffer_id = cursor.consume_u16()?;

                if name_id as usize >= register_name_count {
                    return Err(OxError::InvalidState("register name id out of bounds".into()));
                }
                let name = all_strings[register_start + name_id as usize].clone();

                let array_dims = if array_id != SENTINEL_U16 {
                    if array_id as usize >= array_dim_table.len() {
                        return Err(OxError::InvalidState("register array id out of bounds".into()));
                    }
                    Some(array_dim_table[array_id as usize].clone())
                } else {
                    None
                };

                let buffer_layout = if buffer_id != SENTINEL_U16 {
                    if buffer_id as usize >= buffer_table.len() {
                        return Err(OxError::InvalidState("register shader-buffer id out of bounds".into()));
                    }
                    Some(buffer_table[buffer_id as usize].clone())
                } else {
                    None
                };

                registers.push(SHRegister {
                    register_type,
                    array_dims,
                    name,
                    buffer_layout,
                });
            }

            let mut binary_blobs = BTreeMap::new();
            for bt in BinaryType::ALL {
                if fb.binary_flags & (bt.bit() << 1) != 0 {
                    let st = SizeType::from_code((binary_size_types >> ((bt as u8) * 2)) & 0b11)?;
                    let size = cursor.consume_size(st)?;
                    let data = cursor.consume(size as usize)?.to_vec();
                    binary_blobs.insert(bt, data);
                }
            }

            let stage = if fb.stage_byte >= PIPELINE_STAGE_COUNT {
                if !has_annotation {
                    return Err(OxError::InvalidState(format!(
                        "binary {j} has no valid stage and no shader annotation"
                    )));
                }
                None
            } else {
                Some(PipelineStage::from_code(fb.stage_byte)?)
            };

            binaries.push(SHBinaryInfo {
                identifier: SHBinaryIdentifier {
                    stage,
                    shader_major: fb.shader_model_byte >> 4,
                    shader_minor: fb.shader_model_byte & 0xF,
                    entrypoint,
                    extensions: fb.extensions,
                    uniforms,
                },
                vendor_mask: fb.vendor_mask,
                has_shader_annotation: has_annotation,
                registers,
                binaries: binary_blobs,
            });
        }

        let mut entries = Vec::with_capacity(stage_count);
        let mut semantic_counter = 0usize;
        for (i, fe) in fixed_entries.iter().enumerate() {
            let stage = PipelineStage::from_code(fe.stage)?;
            if fe.binary_count == 0 {
                return Err(OxError::InvalidParameter(format!("entrypoint {i} must reference at least one binary")));
            }
            let name = all_strings[entrypoint_start + i].clone();
            if (0..i).any(|k| all_strings[entrypoint_start + k] == name) {
                return Err(OxError::AlreadyDefined("duplicate entrypoint name".into()));
            }

            let mut entry = SHEntry {
                stage: Some(stage),
                name,
                ..Default::default()
            };

            if stage.is_graphics() {
                let inputs_avail = cursor.consume_u8()?;
                let has_semantics = inputs_avail & 0x80 != 0;
                let inputs = (inputs_avail & 0x7F) as usize;
                let outputs = cursor.consume_u8()? as usize;
                if inputs > 0x10 || outputs > 0x10 {
                    return Err(OxError::InvalidParameter("entrypoint inputs/outputs out of bounds".into()));
                }
                entry.inputs = cursor.consume(inputs)?.to_vec();
                entry.outputs = cursor.consume(outputs)?.to_vec();

                if has_semantics {
                    let header_byte = cursor.consume_u8()?;
                    let unique_in = header_byte & 0xF;
                    let unique_out = header_byte >> 4;
                    entry.unique_input_semantics = unique_in;

                    let start = semantic_counter;
                    semantic_counter += (unique_in + unique_out) as usize;
                    if semantic_counter > semantic_count {
                        return Err(OxError::OutOfBounds("semantic index out of bounds".into()));
                    }
                    let base = semantic_start + start;
                    for k in 0..(unique_in + unique_out) as usize {
                        entry.semantic_names.push(all_strings[base + k].clone());
                    }
                    entry.input_semantic_refs = cursor.consume(inputs)?.to_vec();
                    entry.output_semantic_refs = cursor.consume(outputs)?.to_vec();
                }
            }

            if stage.has_group_dims() {
                entry.group_x = cursor.consume_u16()?;
                entry.group_y = cursor.consume_u16()?;
                entry.group_z = cursor.consume_u16()?;
                entry.wave_size = cursor.consume_u16()?;

                if entry.wave_size != 0 && matches!(stage, PipelineStage::MeshExt | PipelineStage::TaskExt) {
                    return Err(OxError::InvalidParameter("waveSize isn't supported by mesh or task shaders".into()));
                }
                for shift in (0..4).map(|i| i * 4) {
                    let nibble = (entry.wave_size >> shift) & 0xF;
                    if nibble == 1 || nibble == 2 || nibble > 8 {
                        return Err(OxError::InvalidParameter("waveSize contained invalid data".into()));
                    }
                }
            }

            match stage {
                PipelineStage::RaygenExt | PipelineStage::CallableExt => {}
                PipelineStage::ClosestHitExt | PipelineStage::AnyHitExt | PipelineStage::IntersectionExt => {
                    entry.intersection_size = Some(cursor.consume_u8()?);
                    entry.payload_size = Some(cursor.consume_u8()?);
                }
                PipelineStage::MissExt => {
                    entry.payload_size = Some(cursor.consume_u8()?);
                }
                _ => {}
            }

            let mut binary_ids = Vec::with_capacity(fe.binary_count as usize);
            for _ in 0..fe.binary_count {
                let id = cursor.consume_u16()?;
                if id as usize >= binary_count {
                    return Err(OxError::OutOfBounds(format!("binary id {id} out of range")));
                }
                let referenced_entrypoint = fixed_binaries[id as usize].entrypoint_id;
                if referenced_entrypoint != SENTINEL_U16 && referenced_entrypoint as usize != i {
                    return Err(OxError::InvalidParameter(
                        "entrypoint binary reference has mismatching entrypoint id".into(),
                    ));
                }
                binary_ids.push(id);
            }
            entry.binary_ids = binary_ids;

            entries.push(entry);
        }

        let mut includes = Vec::with_capacity(include_count);
        for (i, crc) in include_crc.iter().enumerate() {
            includes.push(SHInclude {
                relative_path: all_strings[include_start + i].clone(),
                crc32c: *crc,
            });
        }

        if !is_sub_file && !cursor.is_empty() {
            return Err(OxError::InvalidState("leftover bytes after oiSH payload".into()));
        }
        let read_length = cursor.offset();

        let file = SHFile {
            settings: SHSettings { is_utf8 },
            compiler_version,
            source_hash,
            binaries,
            entries,
            includes,
            read_length,
        };
        file.validate()?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute_binary(bytes: Vec<u8>) -> SHBinaryInfo {
        SHBinaryInfo {
            identifier: SHBinaryIdentifier {
                stage: Some(PipelineStage::Compute),
                shader_major: 6,
                shader_minor: 5,
                entrypoint: Some("main".into()),
                extensions: 0,
                uniforms: vec![],
            },
            vendor_mask: 0,
            has_shader_annotation: false,
            registers: vec![],
            binaries: BTreeMap::from([(BinaryType::Dxil, bytes)]),
        }
    }

    #[test]
    fn s5_single_compute_entrypoint() {
        let mut file = SHFile::new(SHSettings::default(), 100, 0xDEADBEEF);
        file.binaries.push(compute_binary(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        file.entries.push(SHEntry {
            stage: Some(PipelineStage::Compute),
            name: "main".into(),
            group_x: 8,
            group_y: 8,
            group_z: 1,
            wave_size: 0,
            binary_ids: vec![0],
            ..Default::default()
        });

        let bytes = file.write(false).unwrap();
        assert_eq!(&bytes[0..4], &[0x6F, 0x69, 0x53, 0x48]);

        let back = SHFile::read(&bytes, false).unwrap();
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].group_x, 8);
        assert_eq!(back.binaries[0].binaries.get(&BinaryType::Dxil).unwrap(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(back.binaries[0].identifier.stage, Some(PipelineStage::Compute));
        assert_eq!(back.binaries[0].identifier.shader_major, 6);
        assert_eq!(back.binaries[0].identifier.shader_minor, 5);

        let region_start = 4 + 1 + 1 + 4;
        let stored_hash = u32::from_le_bytes(bytes[6..10].try_into().unwrap());
        let recomputed = crc32c::hash(&bytes[region_start..]);
        assert_eq!(stored_hash, recomputed);
    }

    #[test]
    fn binary_blob_length_uses_minimal_size_type() {
        let mut file = SHFile::new(SHSettings::default(), 1, 0);
        file.binaries.push(compute_binary(vec![0xAB; 10]));
        file.entries.push(SHEntry {
            stage: Some(PipelineStage::Compute),
            name: "main".into(),
            group_x: 1,
            group_y: 1,
            group_z: 1,
            binary_ids: vec![0],
            ..Default::default()
        });

        let bytes = file.write(false).unwrap();
        let back = SHFile::read(&bytes, false).unwrap();
        assert_eq!(back.binaries[0].binaries.get(&BinaryType::Dxil).unwrap().len(), 10);

        // A 10-byte blob only needs a SizeType::U8 length prefix, so a
        // hardcoded U64 length field would have bloated this file by 7 bytes
        // per binary; a file with a tiny blob must stay small.
        let minimal_len = bytes.len();

        let mut big_file = SHFile::new(SHSettings::default(), 1, 0);
        big_file.binaries.push(compute_binary(vec![0xAB; 70_000]));
        big_file.entries.push(SHEntry {
            stage: Some(PipelineStage::Compute),
            name: "main".into(),
            group_x: 1,
            group_y: 1,
            group_z: 1,
            binary_ids: vec![0],
            ..Default::default()
        });
        let big_bytes = big_file.write(false).unwrap();
        let big_back = SHFile::read(&big_bytes, false).unwrap();
        assert_eq!(big_back.binaries[0].binaries.get(&BinaryType::Dxil).unwrap().len(), 70_000);
        assert!(big_bytes.len() - 70_000 > minimal_len - 10);
    }

    #[test]
    fn missing_entrypoint_reference_fails_validate() {
        let mut file = SHFile::new(SHSettings::default(), 1, 0);
        file.binaries.push(compute_binary(vec![1, 2, 3]));
        // No entrypoint references binary 0.
        assert!(file.validate().is_err());
    }

    #[test]
    fn tampered_header_fails_crc() {
        let mut file = SHFile::new(SHSettings::default(), 1, 0);
        file.binaries.push(compute_binary(vec![1, 2, 3]));
        file.entries.push(SHEntry {
            stage: Some(PipelineStage::Compute),
            name: "main".into(),
            binary_ids: vec![0],
            ..Default::default()
        });
        let mut bytes = file.write(false).unwrap();
        bytes[10] ^= 0xFF; // corrupt compiler_version, inside the hashed region
        assert!(matches!(SHFile::read(&bytes, false), Err(OxError::Unauthorized(_))));
    }
}

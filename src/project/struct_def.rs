//! A struct definition: an ordered, offset-indexed field list with stable
//! ids, a backing byte buffer, and a JSON document form.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::IfaceResult;
use crate::core::types::{ProjectError, ProjectResult};
use crate::iface::{NativeHandle, ProcessInterface};

use super::field::{
    default_pod_type, Field, FieldKind, FieldState, PodType, StructRefData, VecData,
};
use super::id_alloc::{FieldId, IdAllocator};

/// Default (and minimum) backing buffer size before any field exists.
const MIN_BUFFER_SIZE: usize = 8;

/// Generation-checked reference to a field. Ids are reused after deletion,
/// so a raw id cached across mutations can silently point at a different
/// field; a handle taken before a structural change refuses to resolve
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHandle {
    pub id: FieldId,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub address: u64,
    /// Whether type swaps consume or shift neighboring fields.
    pub consume_fields: bool,
    pub show_rtti_type_info: bool,
    /// Last-read target memory covering every field offset.
    pub memory_buffer: Vec<u8>,
    fields: Vec<Field>,
    ids: IdAllocator,
    generation: u64,
    /// Index range from the first to the last named field, the "interesting"
    /// span excluding leading and trailing padding.
    named_range: Option<(usize, usize)>,
}

impl StructDef {
    pub fn new(name: impl Into<String>) -> Self {
        StructDef {
            name: name.into(),
            address: 0,
            consume_fields: true,
            show_rtti_type_info: true,
            memory_buffer: vec![0; MIN_BUFFER_SIZE],
            fields: Vec::new(),
            ids: IdAllocator::default(),
            generation: 0,
            named_range: None,
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sum of all field sizes; also the offset one past the last field.
    pub fn total_size(&self) -> usize {
        self.fields.iter().map(Field::memory_size).sum()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn named_range(&self) -> Option<(usize, usize)> {
        self.named_range
    }

    pub fn named_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_named())
    }

    pub fn field_by_id(&self, id: FieldId) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn index_of_id(&self, id: FieldId) -> ProjectResult<usize> {
        self.fields
            .iter()
            .position(|f| f.id == id)
            .ok_or(ProjectError::FieldIdNotFound(id))
    }

    /// Takes a handle valid until the next structural change.
    pub fn handle(&self, id: FieldId) -> ProjectResult<FieldHandle> {
        self.index_of_id(id)?;
        Ok(FieldHandle {
            id,
            generation: self.generation,
        })
    }

    /// Resolves a handle, rejecting it if the struct changed shape since the
    /// handle was taken.
    pub fn resolve(&self, handle: FieldHandle) -> ProjectResult<&Field> {
        if handle.generation != self.generation {
            return Err(ProjectError::StaleHandle(handle.id));
        }
        self.field_by_id(handle.id)
            .ok_or(ProjectError::FieldIdNotFound(handle.id))
    }

    /// Recomputes derived state after any structural change: contiguous
    /// offsets, the named range, and the generation counter.
    fn touch(&mut self) {
        self.generation += 1;

        let mut offset = 0;
        for field in &mut self.fields {
            field.offset = offset;
            offset += field.memory_size();
        }

        let first = self.fields.iter().position(Field::is_named);
        let last = self.fields.iter().rposition(Field::is_named);
        self.named_range = first.zip(last);
    }

    /// Inserts `field` at `index`, allocating an id unless `custom_id`
    /// pins one (used when restoring documents). Unnamed fields get their
    /// placeholder name here. Returns the id.
    pub fn insert_field(
        &mut self,
        index: usize,
        mut field: Field,
        custom_id: Option<FieldId>,
    ) -> FieldId {
        let id = match custom_id {
            Some(id) => {
                self.ids.claim(id);
                id
            }
            None => self.ids.allocate(),
        };
        field.id = id;
        if field.name.is_empty() {
            field.set_default_name();
        }
        self.fields.insert(index.min(self.fields.len()), field);
        self.touch();
        id
    }

    pub fn push_field(&mut self, field: Field) -> FieldId {
        self.insert_field(self.fields.len(), field, None)
    }

    /// Inserts `amount` unnamed pod fields at `index`.
    pub fn insert_padding(&mut self, index: usize, amount: usize, ty: PodType) {
        for i in 0..amount {
            self.insert_field(index + i, Field::unnamed(FieldKind::Pod(ty)), None);
        }
    }

    pub fn push_padding(&mut self, amount: usize, ty: PodType) {
        self.insert_padding(self.fields.len(), amount, ty);
    }

    /// Removes a field and releases its id for reuse.
    pub fn remove_field_by_id(&mut self, id: FieldId) -> ProjectResult<Field> {
        let index = self.index_of_id(id)?;
        let removed = self.fields.remove(index);
        self.ids.free(id);
        self.touch();
        debug!(struct_name = %self.name, field = %removed.name, id, "removed field");
        Ok(removed)
    }

    pub fn remove_field_by_name(&mut self, name: &str) -> ProjectResult<Field> {
        let id = self
            .field_by_name(name)
            .map(|f| f.id)
            .ok_or_else(|| ProjectError::FieldNameNotFound(name.to_string()))?;
        self.remove_field_by_id(id)
    }

    /// Renames a field, promoting it to the named state.
    pub fn rename_field_by_id(&mut self, id: FieldId, new_name: &str) -> ProjectResult<()> {
        let index = self.index_of_id(id)?;
        let field = &mut self.fields[index];
        field.name = new_name.to_string();
        field.state = FieldState::Named;
        self.touch();
        Ok(())
    }

    pub fn rename_field_by_name(&mut self, name: &str, new_name: &str) -> ProjectResult<()> {
        let id = self
            .field_by_name(name)
            .map(|f| f.id)
            .ok_or_else(|| ProjectError::FieldNameNotFound(name.to_string()))?;
        self.rename_field_by_id(id, new_name)
    }

    /// Moves the field with `id` so it ends up at `index` in the new order.
    pub fn move_field(&mut self, id: FieldId, index: usize) -> ProjectResult<()> {
        let from = self.index_of_id(id)?;
        let field = self.fields.remove(from);
        self.fields.insert(index.min(self.fields.len()), field);
        self.touch();
        Ok(())
    }

    pub fn clear_fields(&mut self) {
        self.fields.clear();
        self.ids.clear();
        self.memory_buffer = vec![0; MIN_BUFFER_SIZE];
        self.touch();
    }

    /// Replaces the type of the field with `id` by `new_kind`, keeping the
    /// field's identity and name.
    ///
    /// With `consume_fields` enabled the struct's total layout is preserved:
    /// growing consumes following fields until enough bytes are freed, and
    /// any leftover bytes (from growing past the consumed fields' total, or
    /// from shrinking) are refilled with unnamed pod fields, widest type
    /// first. Exactly zero leftover bytes adds no padding. Growing past the
    /// end of the field list fails with `OutOfSpace` without applying
    /// anything.
    ///
    /// Returns the ids of consumed fields.
    pub fn swap_field(
        &mut self,
        id: FieldId,
        new_kind: FieldKind,
        pointer_size: usize,
    ) -> ProjectResult<Vec<FieldId>> {
        let index = self.index_of_id(id)?;
        if !self.consume_fields {
            self.fields[index].kind = new_kind;
            self.touch();
            return Ok(Vec::new());
        }

        let current_size = self.fields[index].memory_size();
        let new_size = new_kind.memory_size();

        let mut leftover = 0usize;
        if new_size > current_size {
            // Dry run first so a failed swap leaves the struct untouched.
            let mut extra = (new_size - current_size) as i64;
            let mut consumed = 0usize;
            while extra > 0 {
                let Some(next) = self.fields.get(index + 1 + consumed) else {
                    return Err(ProjectError::OutOfSpace {
                        id,
                        needed: extra as usize,
                    });
                };
                extra -= next.memory_size() as i64;
                consumed += 1;
            }
            leftover = (-extra) as usize;

            let removed: Vec<Field> = self
                .fields
                .drain(index + 1..index + 1 + consumed)
                .collect();
            let removed_ids: Vec<FieldId> = removed.iter().map(|f| f.id).collect();
            for field_id in &removed_ids {
                self.ids.free(*field_id);
            }
            self.fill_padding(index + 1, leftover, pointer_size);
            self.fields[index].kind = new_kind;
            self.touch();
            return Ok(removed_ids);
        }

        if new_size < current_size {
            leftover = current_size - new_size;
        }
        self.fill_padding(index + 1, leftover, pointer_size);
        self.fields[index].kind = new_kind;
        self.touch();
        Ok(Vec::new())
    }

    /// Greedy largest-fit-first bin fill: covers `remaining` bytes with
    /// unnamed pod fields starting from the target's widest padding type.
    fn fill_padding(&mut self, mut insert_at: usize, mut remaining: usize, pointer_size: usize) {
        let mut ty = default_pod_type(pointer_size);
        while remaining > 0 {
            while ty.size() > remaining {
                ty = ty.one_smaller();
            }
            let amount = remaining / ty.size();
            self.insert_padding(insert_at, amount, ty);
            insert_at += amount;
            remaining -= amount * ty.size();
        }
    }

    /// Re-reads the struct's memory from the attached target. The buffer is
    /// sized to cover every field but never below the target's pointer size.
    /// A short read keeps the partial bytes and is reported as a warning,
    /// not an error; the next tick simply tries again.
    pub fn read_memory(
        &mut self,
        iface: &mut dyn ProcessInterface,
        handle: NativeHandle,
        pointer_size: usize,
    ) -> IfaceResult<usize> {
        let wanted = self.total_size().max(pointer_size).max(MIN_BUFFER_SIZE);
        if self.memory_buffer.len() != wanted {
            self.memory_buffer.resize(wanted, 0);
        }
        if self.address == 0 {
            return Ok(0);
        }

        let read = iface.read_process_memory(handle, self.address, &mut self.memory_buffer)?;
        if read < wanted {
            warn!(
                struct_name = %self.name,
                wanted,
                read,
                "partial struct memory read"
            );
        }
        Ok(read)
    }

    /// Bytes backing one field, if the last read covered its range.
    pub fn field_bytes(&self, id: FieldId) -> Option<&[u8]> {
        let field = self.field_by_id(id)?;
        self.memory_buffer
            .get(field.offset..field.offset + field.memory_size())
    }

    /// Patches every struct-reference field pointing at `target` with fresh
    /// clones of the target's named fields. Returns whether anything was
    /// touched; sizes may have changed, so offsets are recomputed.
    pub fn apply_struct_ref_clones(
        &mut self,
        target: &str,
        clones: &[Field],
        memory_size: usize,
    ) -> bool {
        let mut patched = false;
        for field in &mut self.fields {
            if let FieldKind::StructRef(data) = &mut field.kind {
                if data.other_struct == target {
                    data.fields = clones.to_vec();
                    data.memory_size = memory_size;
                    patched = true;
                }
            }
        }
        if patched {
            self.touch();
        }
        patched
    }

    /// Follows a rename of another struct through any references to it.
    pub fn rename_struct_refs(&mut self, old: &str, new: &str) -> bool {
        let mut patched = false;
        for field in &mut self.fields {
            if let FieldKind::StructRef(data) = &mut field.kind {
                if data.other_struct == old {
                    data.other_struct = new.to_string();
                    patched = true;
                }
            }
        }
        patched
    }

    pub fn to_document(&self) -> StructDoc {
        let mut docs: Vec<FieldDoc> = Vec::new();
        for field in &self.fields {
            // Runs of identical unnamed pod fields pack into one counted
            // entry; everything else serializes in full.
            if let (false, FieldKind::Pod(ty)) = (field.is_named(), &field.kind) {
                if let Some(FieldDoc::Run(run)) = docs.last_mut() {
                    if run.base_type == *ty {
                        run.count += 1;
                        continue;
                    }
                }
                docs.push(FieldDoc::Run(FieldRun {
                    field_type: FIELD_TYPE_POD.to_string(),
                    base_type: *ty,
                    count: 1,
                }));
                continue;
            }
            docs.push(FieldDoc::Single(Box::new(FieldEntry::from_field(field))));
        }

        StructDoc {
            name: self.name.clone(),
            address: self.address,
            consume_fields: self.consume_fields,
            show_rtti_type_info: self.show_rtti_type_info,
            ids: self.ids.clone(),
            fields: docs,
        }
    }

    /// Rebuilds a struct from its document form. Packed runs re-expand into
    /// that many individual fields with sequentially allocated ids, skipping
    /// ids already pinned by named fields.
    pub fn from_document(doc: StructDoc) -> ProjectResult<StructDef> {
        let mut def = StructDef::new(doc.name);
        def.address = doc.address;
        def.consume_fields = doc.consume_fields;
        def.show_rtti_type_info = doc.show_rtti_type_info;
        def.ids = doc.ids;

        let pinned: std::collections::HashSet<FieldId> = doc
            .fields
            .iter()
            .filter_map(|entry| match entry {
                FieldDoc::Single(field) => Some(field.id),
                FieldDoc::Run(_) => None,
            })
            .collect();

        let mut id_counter: FieldId = 1;
        for entry in doc.fields {
            match entry {
                FieldDoc::Single(field) => {
                    let id = field.id;
                    if id == IdAllocator::INVALID_ID {
                        return Err(ProjectError::Document(format!(
                            "field {:?} has no id",
                            field.name
                        )));
                    }
                    let index = def.len();
                    def.insert_field(index, field.into_field()?, Some(id));
                }
                FieldDoc::Run(run) => {
                    if run.field_type != FIELD_TYPE_POD {
                        return Err(ProjectError::Document(format!(
                            "packed run of non-pod type {:?}",
                            run.field_type
                        )));
                    }
                    for _ in 0..run.count {
                        while pinned.contains(&id_counter) {
                            id_counter += 1;
                        }
                        let index = def.len();
                        def.insert_field(
                            index,
                            Field::unnamed(FieldKind::Pod(run.base_type)),
                            Some(id_counter),
                        );
                        id_counter += 1;
                    }
                }
            }
        }
        Ok(def)
    }
}

/// `field_type` tag for scalar fields and packed runs.
pub const FIELD_TYPE_POD: &str = "POD";
/// `field_type` tag for struct-reference fields.
pub const FIELD_TYPE_STRUCT: &str = "STRUCT";

/// Serialized form of one field-list entry. Fully written fields are tried
/// first; an entry without the per-field keys is a packed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDoc {
    Single(Box<FieldEntry>),
    Run(FieldRun),
}

/// A run of `count` identical consecutive unnamed pod fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRun {
    pub field_type: String,
    pub base_type: PodType,
    pub count: usize,
}

/// One fully written field: the common keys plus kind-specific extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    pub id: FieldId,
    pub offset: usize,
    pub state: FieldState,
    /// Kind tag: `POD`, `STRUCT`, or a vector shape name such as `VEC3`.
    pub field_type: String,
    /// Scalar or component type; absent for struct references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<PodType>,
    #[serde(default = "FieldEntry::default_count")]
    pub count: usize,
    #[serde(default)]
    pub is_pointer_to: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<FieldExtras>,
}

/// Kind-specific payload of a fully written field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldExtras {
    Vec(VecData),
    StructRef { other_struct: String },
}

impl FieldEntry {
    fn default_count() -> usize {
        1
    }

    fn from_field(field: &Field) -> FieldEntry {
        let (field_type, base_type, extras) = match &field.kind {
            FieldKind::Pod(ty) => (FIELD_TYPE_POD.to_string(), Some(*ty), None),
            FieldKind::Vec(data) => (
                data.shape.type_name().to_string(),
                data.components.first().map(|c| c.ty),
                Some(FieldExtras::Vec(data.clone())),
            ),
            FieldKind::StructRef(data) => (
                FIELD_TYPE_STRUCT.to_string(),
                None,
                Some(FieldExtras::StructRef {
                    other_struct: data.other_struct.clone(),
                }),
            ),
        };
        FieldEntry {
            name: field.name.clone(),
            id: field.id,
            offset: field.offset,
            state: field.state,
            field_type,
            base_type,
            count: 1,
            is_pointer_to: field.is_pointer_to,
            extras,
        }
    }

    fn into_field(self) -> ProjectResult<Field> {
        let kind = match (self.field_type.as_str(), self.base_type, self.extras) {
            (FIELD_TYPE_POD, Some(ty), _) => FieldKind::Pod(ty),
            (FIELD_TYPE_STRUCT, _, Some(FieldExtras::StructRef { other_struct })) => {
                FieldKind::StructRef(StructRefData::new(other_struct))
            }
            (_, _, Some(FieldExtras::Vec(data))) => FieldKind::Vec(data),
            _ => {
                return Err(ProjectError::Document(format!(
                    "field {:?} has malformed type {:?}",
                    self.name, self.field_type
                )));
            }
        };
        Ok(Field {
            id: self.id,
            name: self.name,
            offset: self.offset,
            state: self.state,
            kind,
            is_pointer_to: self.is_pointer_to,
            is_dummy: false,
        })
    }
}

/// Serialized form of a whole struct definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructDoc {
    pub name: String,
    #[serde(default)]
    pub address: u64,
    #[serde(default)]
    pub consume_fields: bool,
    #[serde(default)]
    pub show_rtti_type_info: bool,
    #[serde(flatten)]
    ids: IdAllocator,
    pub fields: Vec<FieldDoc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::field::VecData;
    use pretty_assertions::assert_eq;

    fn sizes(def: &StructDef) -> Vec<usize> {
        def.fields().iter().map(Field::memory_size).collect()
    }

    fn offsets(def: &StructDef) -> Vec<usize> {
        def.fields().iter().map(|f| f.offset).collect()
    }

    #[test]
    fn offsets_stay_contiguous() {
        let mut def = StructDef::new("Player");
        def.push_field(Field::named("hp", FieldKind::Pod(PodType::I32)));
        def.push_field(Field::named("pos", FieldKind::Vec(VecData::vec3(PodType::F32))));
        def.push_padding(2, PodType::I64);

        assert_eq!(offsets(&def), vec![0, 4, 16, 24]);
        assert_eq!(def.total_size(), 32);

        def.remove_field_by_name("hp").unwrap();
        assert_eq!(offsets(&def), vec![0, 12, 20]);
    }

    #[test]
    fn named_range_skips_leading_and_trailing_padding() {
        let mut def = StructDef::new("Player");
        def.push_padding(2, PodType::I32);
        def.push_field(Field::named("hp", FieldKind::Pod(PodType::I32)));
        def.push_field(Field::named("mp", FieldKind::Pod(PodType::I32)));
        def.push_padding(1, PodType::I32);

        assert_eq!(def.named_range(), Some((2, 3)));

        def.clear_fields();
        assert_eq!(def.named_range(), None);
    }

    #[test]
    fn removed_ids_are_reused() {
        let mut def = StructDef::new("Player");
        let a = def.push_field(Field::unnamed(FieldKind::Pod(PodType::I64)));
        let b = def.push_field(Field::unnamed(FieldKind::Pod(PodType::I64)));
        assert_eq!((a, b), (1, 2));

        def.remove_field_by_id(a).unwrap();
        let c = def.push_field(Field::unnamed(FieldKind::Pod(PodType::I64)));
        assert_eq!(c, a);
    }

    #[test]
    fn handles_go_stale_after_structural_changes() {
        let mut def = StructDef::new("Player");
        let id = def.push_field(Field::named("hp", FieldKind::Pod(PodType::I32)));
        let handle = def.handle(id).unwrap();
        assert_eq!(def.resolve(handle).unwrap().name, "hp");

        def.push_padding(1, PodType::I8);
        assert_eq!(
            def.resolve(handle).unwrap_err(),
            ProjectError::StaleHandle(id)
        );
    }

    #[test]
    fn growing_swap_consumes_neighbors_and_refills() {
        // The layout from the swap design: 8 | 4 | 4 | 16, replace the first
        // field by a 20-byte one. Both fours vanish and 4 bytes are carved
        // from the 16, leaving 12 bytes of fresh padding.
        let mut def = StructDef::new("Player");
        let target = def.push_field(Field::named("obj", FieldKind::Pod(PodType::I64)));
        def.push_padding(1, PodType::I32);
        def.push_padding(1, PodType::I32);
        def.push_field(Field::unnamed(FieldKind::Vec(VecData::matrix(
            PodType::F32,
            2,
            2,
            true,
        ))));
        assert_eq!(sizes(&def), vec![8, 4, 4, 16]);

        let new_kind = FieldKind::Vec(VecData::matrix(PodType::F32, 1, 5, true)); // 20 bytes
        let removed = def.swap_field(target, new_kind, 8).unwrap();
        assert_eq!(removed.len(), 3);

        assert_eq!(sizes(&def), vec![20, 8, 4]);
        assert_eq!(offsets(&def), vec![0, 20, 28]);
        assert_eq!(def.total_size(), 32);
        assert_eq!(def.field_by_id(target).unwrap().name, "obj");
    }

    #[test]
    fn shrinking_swap_backfills_padding() {
        let mut def = StructDef::new("Player");
        let target = def.push_field(Field::named("wide", FieldKind::Pod(PodType::I64)));
        def.swap_field(target, FieldKind::Pod(PodType::I8), 8).unwrap();

        // 7 leftover bytes: I32 + I16 + I8.
        assert_eq!(sizes(&def), vec![1, 4, 2, 1]);
        assert_eq!(def.total_size(), 8);
        assert!(def.fields()[1..].iter().all(|f| !f.is_named()));
    }

    #[test]
    fn equal_size_swap_adds_no_padding() {
        let mut def = StructDef::new("Player");
        let target = def.push_field(Field::named("x", FieldKind::Pod(PodType::I64)));
        def.swap_field(target, FieldKind::Pod(PodType::F64), 8).unwrap();
        assert_eq!(sizes(&def), vec![8]);
    }

    #[test]
    fn growing_swap_past_the_end_fails_without_changes() {
        let mut def = StructDef::new("Player");
        let target = def.push_field(Field::named("x", FieldKind::Pod(PodType::I32)));
        def.push_padding(1, PodType::I32);
        let before = def.clone();

        let err = def
            .swap_field(
                target,
                FieldKind::Vec(VecData::matrix(PodType::F32, 4, 4, true)),
                8,
            )
            .unwrap_err();
        assert!(matches!(err, ProjectError::OutOfSpace { .. }));
        assert_eq!(def, before);
    }

    #[test]
    fn swap_without_consume_just_replaces() {
        let mut def = StructDef::new("Player");
        def.consume_fields = false;
        let target = def.push_field(Field::named("x", FieldKind::Pod(PodType::I64)));
        def.push_padding(1, PodType::I32);

        def.swap_field(target, FieldKind::Pod(PodType::I8), 8).unwrap();
        assert_eq!(sizes(&def), vec![1, 4]);
    }

    #[test]
    fn document_round_trip_preserves_layout() {
        let mut def = StructDef::new("Player");
        def.address = 0x1400_0000;
        def.push_field(Field::named("hp", FieldKind::Pod(PodType::I32)));
        def.push_padding(3, PodType::I32);
        def.push_field(Field::named(
            "pos",
            FieldKind::Vec(VecData::vec3(PodType::F32)),
        ));

        let json = serde_json::to_string(&def.to_document()).unwrap();
        let doc: StructDoc = serde_json::from_str(&json).unwrap();
        let restored = StructDef::from_document(doc).unwrap();

        let shape = |d: &StructDef| {
            d.fields()
                .iter()
                .map(|f| (f.name.clone(), f.offset, f.type_name(), f.memory_size()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&restored), shape(&def));
        assert_eq!(restored.address, def.address);
    }

    #[test]
    fn packed_runs_reexpand_with_distinct_sequential_ids() {
        let mut def = StructDef::new("Player");
        def.push_padding(16, PodType::I32);

        let doc = def.to_document();
        // A single packed entry stands in for all sixteen fields.
        assert_eq!(doc.fields.len(), 1);
        match &doc.fields[0] {
            FieldDoc::Run(run) => {
                assert_eq!(run.field_type, FIELD_TYPE_POD);
                assert_eq!(run.base_type, PodType::I32);
                assert_eq!(run.count, 16);
            }
            other => panic!("expected a packed run, got {other:?}"),
        }

        let restored = StructDef::from_document(doc).unwrap();
        assert_eq!(restored.len(), 16);
        let mut ids: Vec<FieldId> = restored.fields().iter().map(|f| f.id).collect();
        assert_eq!(ids, (1..=16).collect::<Vec<_>>());
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn documents_carry_field_type_and_base_type_keys() {
        use super::super::field::StructRefData;

        let mut def = StructDef::new("Player");
        def.push_field(Field::named("hp", FieldKind::Pod(PodType::I32)));
        def.push_field(Field::named(
            "pos",
            FieldKind::Vec(VecData::vec3(PodType::F32)),
        ));
        def.push_field(Field::named(
            "weapon",
            FieldKind::StructRef(StructRefData::new("Weapon")),
        ));
        def.push_padding(4, PodType::I64);

        let json = serde_json::to_value(def.to_document()).unwrap();
        let fields = json["fields"].as_array().unwrap();

        assert_eq!(fields[0]["field_type"], "POD");
        assert_eq!(fields[0]["base_type"], "I32");
        assert_eq!(fields[0]["count"], 1);
        assert_eq!(fields[0]["name"], "hp");

        assert_eq!(fields[1]["field_type"], "VEC3");
        assert_eq!(fields[1]["base_type"], "F32");

        assert_eq!(fields[2]["field_type"], "STRUCT");
        assert!(fields[2].get("base_type").is_none());
        assert_eq!(fields[2]["extras"]["other_struct"], "Weapon");
        // Derived clones of the referenced struct never hit the document.
        assert!(fields[2]["extras"].get("fields").is_none());

        // The padding run carries only the type keys and the count.
        assert_eq!(fields[3]["field_type"], "POD");
        assert_eq!(fields[3]["base_type"], "I64");
        assert_eq!(fields[3]["count"], 4);
        assert!(fields[3].get("name").is_none());
    }

    #[test]
    fn packed_runs_skip_ids_held_by_named_fields() {
        let mut def = StructDef::new("Player");
        def.push_padding(2, PodType::I64);
        let named = def.push_field(Field::named("hp", FieldKind::Pod(PodType::I32)));
        assert_eq!(named, 3);

        let restored = StructDef::from_document(def.to_document()).unwrap();
        let ids: Vec<FieldId> = restored.fields().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(restored.field_by_id(3).unwrap().name, "hp");
    }

    #[test]
    fn runs_split_on_type_changes() {
        let mut def = StructDef::new("Player");
        def.push_padding(2, PodType::I32);
        def.push_padding(2, PodType::I16);
        def.push_padding(1, PodType::I32);

        let doc = def.to_document();
        assert_eq!(doc.fields.len(), 3);
    }

    #[test]
    fn read_memory_sizes_buffer_and_tolerates_short_reads() {
        use crate::host::testing::MockInterface;
        use crate::iface::ProcessInterface;

        let mut iface = MockInterface::default();
        let mut handle_iface: &mut dyn ProcessInterface = &mut iface;
        let handle = handle_iface.open_process(MockInterface::PID).unwrap();

        let mut def = StructDef::new("Player");
        def.push_padding(4, PodType::I64);
        // Straddles the region end on purpose.
        def.address = MockInterface::IMAGE_BASE + MockInterface::REGION_SIZE - 16;

        let read = def.read_memory(handle_iface, handle, 8).unwrap();
        assert_eq!(read, 16);
        assert_eq!(def.memory_buffer.len(), 32);

        // Fully mapped read fills the whole buffer.
        def.address = MockInterface::IMAGE_BASE;
        let read = def.read_memory(handle_iface, handle, 8).unwrap();
        assert_eq!(read, 32);
    }
}

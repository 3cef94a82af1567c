//! Project state: the set of struct definitions plus the command queue that
//! sequences cross-struct edits.
//!
//! Field-level edits raised while iterating (remove, type swap) are queued
//! as commands and drained once per tick by [`Project::pump`], so no edit
//! mutates a struct someone is still walking. Shape changes fan out to
//! struct-reference fields in other structs, which re-clone the referenced
//! struct's named fields.

pub mod field;
pub mod id_alloc;
pub mod struct_def;

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{ProjectError, ProjectResult};

use field::{Field, FieldKind};
use id_alloc::FieldId;
use struct_def::{StructDef, StructDoc};

/// A deferred edit, applied at the next [`Project::pump`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectCommand {
    RemoveField {
        struct_name: String,
        field_id: FieldId,
    },
    SwapField {
        struct_name: String,
        field_id: FieldId,
        new_kind: FieldKind,
    },
    /// A struct changed shape; references to it must re-clone.
    StructUpdated { struct_name: String },
}

#[derive(Debug, Default)]
pub struct Project {
    structs: HashMap<String, StructDef>,
    commands: VecDeque<ProjectCommand>,
    dirty: bool,
}

impl Project {
    pub fn new() -> Self {
        Project::default()
    }

    pub fn structs(&self) -> impl Iterator<Item = &StructDef> {
        self.structs.values()
    }

    pub fn get(&self, name: &str) -> Option<&StructDef> {
        self.structs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut StructDef> {
        self.dirty = true;
        self.structs.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.structs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structs.is_empty()
    }

    /// Whether any edit happened since the last save or load.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn add_struct(&mut self, name: impl Into<String>) -> ProjectResult<&mut StructDef> {
        let name = name.into();
        if self.structs.contains_key(&name) {
            return Err(ProjectError::DuplicateStruct(name));
        }
        self.dirty = true;
        Ok(self
            .structs
            .entry(name.clone())
            .or_insert_with(|| StructDef::new(name)))
    }

    pub fn remove_struct(&mut self, name: &str) -> ProjectResult<StructDef> {
        let removed = self
            .structs
            .remove(name)
            .ok_or_else(|| ProjectError::StructNotFound(name.to_string()))?;
        self.dirty = true;
        // References to the removed struct keep their clones but go stale;
        // they resolve again if a struct with that name returns.
        Ok(removed)
    }

    /// Renames a struct and follows the rename through every reference to
    /// it. Applied immediately; only field-level edits are deferred.
    pub fn rename_struct(&mut self, old: &str, new: &str) -> ProjectResult<()> {
        if self.structs.contains_key(new) {
            return Err(ProjectError::DuplicateStruct(new.to_string()));
        }
        let mut def = self
            .structs
            .remove(old)
            .ok_or_else(|| ProjectError::StructNotFound(old.to_string()))?;
        def.name = new.to_string();
        self.structs.insert(new.to_string(), def);

        for def in self.structs.values_mut() {
            def.rename_struct_refs(old, new);
        }
        self.dirty = true;
        debug!(old, new, "renamed struct");
        Ok(())
    }

    pub fn queue(&mut self, command: ProjectCommand) {
        self.commands.push_back(command);
    }

    /// Drains the command queue, applying each edit in order. `pointer_size`
    /// parameterizes padding refill on type swaps. Failed commands are
    /// logged and dropped; the queue always ends the tick empty.
    pub fn pump(&mut self, pointer_size: usize) {
        while let Some(command) = self.commands.pop_front() {
            if let Err(err) = self.apply(command, pointer_size) {
                warn!(%err, "project command failed");
            }
        }
    }

    fn apply(&mut self, command: ProjectCommand, pointer_size: usize) -> ProjectResult<()> {
        match command {
            ProjectCommand::RemoveField {
                struct_name,
                field_id,
            } => {
                let def = self
                    .structs
                    .get_mut(&struct_name)
                    .ok_or_else(|| ProjectError::StructNotFound(struct_name.clone()))?;
                def.remove_field_by_id(field_id)?;
                self.dirty = true;
                self.commands
                    .push_back(ProjectCommand::StructUpdated { struct_name });
                Ok(())
            }
            ProjectCommand::SwapField {
                struct_name,
                field_id,
                new_kind,
            } => {
                let def = self
                    .structs
                    .get_mut(&struct_name)
                    .ok_or_else(|| ProjectError::StructNotFound(struct_name.clone()))?;
                def.swap_field(field_id, new_kind, pointer_size)?;
                self.dirty = true;
                self.commands
                    .push_back(ProjectCommand::StructUpdated { struct_name });
                Ok(())
            }
            ProjectCommand::StructUpdated { struct_name } => {
                self.update_struct_refs(&struct_name);
                Ok(())
            }
        }
    }

    /// Re-clones `target`'s named fields into every struct-reference field
    /// pointing at it. The clones are read-only dummies: they keep the
    /// source field's offset and type but get synthetic ids counted down
    /// from `u64::MAX`, so they can never collide with allocator-issued
    /// ids, and are never serialized.
    fn update_struct_refs(&mut self, target: &str) {
        let Some(source) = self.structs.get(target) else {
            return;
        };
        let clones: Vec<Field> = source
            .named_fields()
            .enumerate()
            .map(|(index, field)| {
                let mut clone = field.clone();
                clone.id = u64::MAX - index as u64;
                clone.is_dummy = true;
                clone
            })
            .collect();
        let memory_size = clones.iter().map(Field::memory_size).sum();

        for def in self.structs.values_mut() {
            def.apply_struct_ref_clones(target, &clones, memory_size);
        }
    }

    pub fn to_document(&self) -> ProjectDoc {
        let mut structs: Vec<StructDoc> = self
            .structs
            .values()
            .map(StructDef::to_document)
            .collect();
        structs.sort_by(|a, b| a.name.cmp(&b.name));
        ProjectDoc { structs }
    }

    pub fn from_document(doc: ProjectDoc) -> ProjectResult<Project> {
        let mut project = Project::new();
        for struct_doc in doc.structs {
            let def = StructDef::from_document(struct_doc)?;
            if project.structs.insert(def.name.clone(), def).is_some() {
                return Err(ProjectError::Document(
                    "duplicate struct name in document".into(),
                ));
            }
        }
        // Struct references materialize their clones on load.
        let names: Vec<String> = project.structs.keys().cloned().collect();
        for name in names {
            project.update_struct_refs(&name);
        }
        Ok(project)
    }

    pub fn save(&mut self, path: impl AsRef<Path>) -> ProjectResult<()> {
        let json = serde_json::to_string_pretty(&self.to_document())
            .map_err(|err| ProjectError::Document(err.to_string()))?;
        fs::write(path.as_ref(), json)
            .map_err(|err| ProjectError::Document(err.to_string()))?;
        self.dirty = false;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> ProjectResult<Project> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|err| ProjectError::Document(err.to_string()))?;
        let doc: ProjectDoc =
            serde_json::from_str(&json).map_err(|err| ProjectError::Document(err.to_string()))?;
        Self::from_document(doc)
    }
}

/// On-disk project form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDoc {
    pub structs: Vec<StructDoc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use field::{FieldState, PodType, StructRefData, VecData};

    fn project_with_player() -> (Project, FieldId) {
        let mut project = Project::new();
        let def = project.add_struct("Player").unwrap();
        let hp = def.push_field(Field::named("hp", FieldKind::Pod(PodType::I32)));
        def.push_field(Field::named(
            "pos",
            FieldKind::Vec(VecData::vec3(PodType::F32)),
        ));
        (project, hp)
    }

    #[test]
    fn duplicate_struct_names_are_rejected() {
        let mut project = Project::new();
        project.add_struct("Player").unwrap();
        assert!(matches!(
            project.add_struct("Player"),
            Err(ProjectError::DuplicateStruct(_))
        ));
    }

    #[test]
    fn queued_remove_applies_on_pump() {
        let (mut project, hp) = project_with_player();
        project.queue(ProjectCommand::RemoveField {
            struct_name: "Player".into(),
            field_id: hp,
        });
        assert_eq!(project.get("Player").unwrap().len(), 2);

        project.pump(8);
        assert_eq!(project.get("Player").unwrap().len(), 1);
        assert!(project.get("Player").unwrap().field_by_name("hp").is_none());
    }

    #[test]
    fn queued_swap_applies_on_pump() {
        let (mut project, hp) = project_with_player();
        project.queue(ProjectCommand::SwapField {
            struct_name: "Player".into(),
            field_id: hp,
            new_kind: FieldKind::Pod(PodType::I8),
        });
        project.pump(8);

        let def = project.get("Player").unwrap();
        // 3 leftover bytes backfilled as I16 + I8.
        assert_eq!(def.len(), 4);
        assert_eq!(def.field_by_id(hp).unwrap().memory_size(), 1);
    }

    #[test]
    fn commands_against_missing_structs_are_dropped() {
        let (mut project, hp) = project_with_player();
        project.queue(ProjectCommand::RemoveField {
            struct_name: "Ghost".into(),
            field_id: hp,
        });
        project.pump(8); // must not panic
        assert_eq!(project.get("Player").unwrap().len(), 2);
    }

    #[test]
    fn struct_refs_reclone_after_target_changes() {
        let (mut project, _) = project_with_player();
        let world = project.add_struct("World").unwrap();
        let player_ref = world.push_field(Field::named(
            "player",
            FieldKind::StructRef(StructRefData::new("Player")),
        ));

        project.queue(ProjectCommand::StructUpdated {
            struct_name: "Player".into(),
        });
        project.pump(8);

        let world = project.get("World").unwrap();
        let FieldKind::StructRef(data) = &world.field_by_id(player_ref).unwrap().kind else {
            panic!("expected a struct reference");
        };
        assert_eq!(data.fields.len(), 2);
        assert_eq!(data.memory_size, 16);
        assert!(data.fields.iter().all(|f| f.is_dummy));

        // Clone ids are synthetic and outside both structs' id spaces.
        for clone in &data.fields {
            assert!(clone.id > u64::MAX - 16);
            assert!(project.get("Player").unwrap().field_by_id(clone.id).is_none());
            assert!(world.field_by_id(clone.id).is_none());
        }

        // Removing a named field from the target shrinks the reference.
        let hp = project.get("Player").unwrap().field_by_name("hp").unwrap().id;
        project.queue(ProjectCommand::RemoveField {
            struct_name: "Player".into(),
            field_id: hp,
        });
        project.pump(8);

        let world = project.get("World").unwrap();
        let FieldKind::StructRef(data) = &world.field_by_id(player_ref).unwrap().kind else {
            panic!("expected a struct reference");
        };
        assert_eq!(data.fields.len(), 1);
        assert_eq!(data.memory_size, 12);
    }

    #[test]
    fn struct_rename_follows_through_references() {
        let (mut project, _) = project_with_player();
        let world = project.add_struct("World").unwrap();
        world.push_field(Field::named(
            "player",
            FieldKind::StructRef(StructRefData::new("Player")),
        ));

        project.rename_struct("Player", "Hero").unwrap();
        assert!(project.get("Player").is_none());
        assert_eq!(project.get("Hero").unwrap().name, "Hero");

        let world = project.get("World").unwrap();
        let FieldKind::StructRef(data) = &world.fields()[0].kind else {
            panic!("expected a struct reference");
        };
        assert_eq!(data.other_struct, "Hero");
    }

    #[test]
    fn rename_to_existing_name_is_rejected() {
        let (mut project, _) = project_with_player();
        project.add_struct("World").unwrap();
        assert!(matches!(
            project.rename_struct("Player", "World"),
            Err(ProjectError::DuplicateStruct(_))
        ));
        assert!(project.get("Player").is_some());
    }

    #[test]
    fn dirty_flag_tracks_edits_and_saves() {
        let (mut project, _) = project_with_player();
        assert!(project.is_dirty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        project.save(&path).unwrap();
        assert!(!project.is_dirty());

        let reloaded = Project::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("Player").unwrap().len(), 2);
    }

    #[test]
    fn project_document_round_trip() {
        let (mut project, hp) = project_with_player();
        project
            .get_mut("Player")
            .unwrap()
            .rename_field_by_id(hp, "health")
            .unwrap();
        let world = project.add_struct("World").unwrap();
        world.push_padding(8, PodType::I64);

        let doc = project.to_document();
        let restored = Project::from_document(doc).unwrap();

        assert_eq!(restored.len(), 2);
        let player = restored.get("Player").unwrap();
        assert_eq!(player.field_by_name("health").map(|f| f.state), Some(FieldState::Named));
        assert_eq!(restored.get("World").unwrap().len(), 8);
    }
}

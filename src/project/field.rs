//! Typed field model: scalar pods, component vectors and nested struct
//! references, expressed as a closed sum over the known kinds.

use serde::{Deserialize, Serialize};

use super::id_alloc::FieldId;

/// Scalar plain-old-data types a field or vector component can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl PodType {
    pub fn size(self) -> usize {
        match self {
            PodType::I8 | PodType::U8 => 1,
            PodType::I16 | PodType::U16 => 2,
            PodType::I32 | PodType::U32 | PodType::F32 => 4,
            PodType::I64 | PodType::U64 | PodType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PodType::I8 => "I8",
            PodType::I16 => "I16",
            PodType::I32 => "I32",
            PodType::I64 => "I64",
            PodType::U8 => "U8",
            PodType::U16 => "U16",
            PodType::U32 => "U32",
            PodType::U64 => "U64",
            PodType::F32 => "F32",
            PodType::F64 => "F64",
        }
    }

    /// Next smaller signed type, used by the padding bin-fill.
    pub fn one_smaller(self) -> PodType {
        match self {
            PodType::I64 => PodType::I32,
            PodType::I32 => PodType::I16,
            _ => PodType::I8,
        }
    }
}

/// Widest padding type for a target with the given pointer size.
pub fn default_pod_type(pointer_size: usize) -> PodType {
    if pointer_size == 8 {
        PodType::I64
    } else {
        PodType::I32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EulerOrder {
    Xyz,
    Xzy,
    Yxz,
    Yzx,
    Zxy,
    Zyx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorFormat {
    Rgb,
    Rgba,
    Argb,
    Bgra,
    Abgr,
}

impl ColorFormat {
    fn component_names(self) -> &'static str {
        match self {
            ColorFormat::Rgb => "rgb",
            ColorFormat::Rgba => "rgba",
            ColorFormat::Argb => "argb",
            ColorFormat::Bgra => "bgra",
            ColorFormat::Abgr => "abgr",
        }
    }
}

/// One named component of a vector-like field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VecComponent {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: PodType,
}

/// The vector-like shapes, each fixing how components are named.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VecShape {
    Vec2,
    Vec3,
    Vec4,
    Euler(EulerOrder),
    Color(ColorFormat),
    Quaternion,
    Matrix { row_major: bool, rows: usize, cols: usize },
}

impl VecShape {
    pub fn type_name(self) -> &'static str {
        match self {
            VecShape::Vec2 => "VEC2",
            VecShape::Vec3 => "VEC3",
            VecShape::Vec4 => "VEC4",
            VecShape::Euler(_) => "EULER",
            VecShape::Color(_) => "COLOR",
            VecShape::Quaternion => "QUATERNION",
            VecShape::Matrix { row_major: true, .. } => "MATRIX_ROW_MAJOR",
            VecShape::Matrix { row_major: false, .. } => "MATRIX_COLUMN_MAJOR",
        }
    }
}

/// A vector-like field: shape plus its expanded component list, with the
/// total size cached since matrices can get large.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VecData {
    pub shape: VecShape,
    pub components: Vec<VecComponent>,
    pub memory_size: usize,
}

impl VecData {
    fn from_components(shape: VecShape, components: Vec<VecComponent>) -> Self {
        let memory_size = components.iter().map(|c| c.ty.size()).sum();
        VecData {
            shape,
            components,
            memory_size,
        }
    }

    fn named(shape: VecShape, ty: PodType, names: &[&str]) -> Self {
        let components = names
            .iter()
            .map(|name| VecComponent {
                name: (*name).to_string(),
                ty,
            })
            .collect();
        Self::from_components(shape, components)
    }

    pub fn vec2(ty: PodType) -> Self {
        Self::named(VecShape::Vec2, ty, &["x", "y"])
    }

    pub fn vec3(ty: PodType) -> Self {
        Self::named(VecShape::Vec3, ty, &["x", "y", "z"])
    }

    pub fn vec4(ty: PodType) -> Self {
        Self::named(VecShape::Vec4, ty, &["x", "y", "z", "w"])
    }

    pub fn euler(ty: PodType, order: EulerOrder) -> Self {
        let names = match order {
            EulerOrder::Xyz => ["x", "y", "z"],
            EulerOrder::Xzy => ["x", "z", "y"],
            EulerOrder::Yxz => ["y", "x", "z"],
            EulerOrder::Yzx => ["y", "z", "x"],
            EulerOrder::Zxy => ["z", "x", "y"],
            EulerOrder::Zyx => ["z", "y", "x"],
        };
        Self::named(VecShape::Euler(order), ty, &names)
    }

    pub fn color(ty: PodType, format: ColorFormat) -> Self {
        let components = format
            .component_names()
            .chars()
            .map(|c| VecComponent {
                name: c.to_string(),
                ty,
            })
            .collect();
        Self::from_components(VecShape::Color(format), components)
    }

    pub fn quaternion(ty: PodType) -> Self {
        Self::named(VecShape::Quaternion, ty, &["x", "y", "z", "w"])
    }

    pub fn matrix(ty: PodType, rows: usize, cols: usize, row_major: bool) -> Self {
        let components = (0..rows * cols)
            .map(|i| VecComponent {
                name: if row_major {
                    format!("m{}{}", i / cols, i % cols)
                } else {
                    format!("m{}{}", i % rows, i / rows)
                },
                ty,
            })
            .collect();
        Self::from_components(VecShape::Matrix { row_major, rows, cols }, components)
    }
}

/// A field whose type is another struct in the project. Carries read-only
/// clones of the referenced struct's named fields; the clones are derived
/// state, rebuilt whenever the referenced struct changes shape, and never
/// serialized on their own.
#[derive(Debug, Clone, PartialEq)]
pub struct StructRefData {
    pub other_struct: String,
    pub fields: Vec<Field>,
    pub memory_size: usize,
}

impl StructRefData {
    pub fn new(other_struct: impl Into<String>) -> Self {
        StructRefData {
            other_struct: other_struct.into(),
            fields: Vec::new(),
            memory_size: 0,
        }
    }
}

/// The closed set of field kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Pod(PodType),
    Vec(VecData),
    StructRef(StructRefData),
}

impl FieldKind {
    pub fn memory_size(&self) -> usize {
        match self {
            FieldKind::Pod(ty) => ty.size(),
            FieldKind::Vec(data) => data.memory_size,
            FieldKind::StructRef(data) => data.memory_size,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            FieldKind::Pod(ty) => ty.name().to_string(),
            FieldKind::Vec(data) => data.shape.type_name().to_string(),
            FieldKind::StructRef(data) => data.other_struct.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldState {
    Unnamed,
    Named,
}

/// One field of a struct definition. Offsets are derived state, recomputed
/// by the owning struct after every structural change. The on-disk form
/// lives in the struct document types, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: FieldId,
    pub name: String,
    pub offset: usize,
    pub state: FieldState,
    pub kind: FieldKind,
    pub is_pointer_to: bool,
    /// Derived clone inside a struct reference; excluded from editing and
    /// serialization.
    pub is_dummy: bool,
}

impl Field {
    pub fn unnamed(kind: FieldKind) -> Self {
        Field {
            id: 0,
            name: String::new(),
            offset: 0,
            state: FieldState::Unnamed,
            kind,
            is_pointer_to: false,
            is_dummy: false,
        }
    }

    pub fn named(name: impl Into<String>, kind: FieldKind) -> Self {
        Field {
            name: name.into(),
            state: FieldState::Named,
            ..Field::unnamed(kind)
        }
    }

    pub fn memory_size(&self) -> usize {
        self.kind.memory_size()
    }

    pub fn type_name(&self) -> String {
        self.kind.type_name()
    }

    pub fn is_named(&self) -> bool {
        self.state == FieldState::Named
    }

    /// Placeholder name derived from the id, shown until the user names the
    /// field.
    pub fn set_default_name(&mut self) {
        self.name = format!("unnamed_{}", self.id);
    }
}

//! Type arena and table.
//!
//! The `TypeTable` owns every `Type` instance of a compilation; references
//! between types are [`TypeId`] indices, so cyclic shapes (a struct holding a
//! pointer to itself) need no shared ownership. Named types (typedefs,
//! structs, unions) are interned under tagged keys, and struct/union layouts
//! are computed once and cached.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::error::{Diagnostics, Pos};

/// Index of a `Type` in the table's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone)]
pub enum Type {
    Void,
    Integer {
        size: u32,
        signed: bool,
        name: &'static str,
    },
    Pointer {
        base: TypeId,
    },
    Array {
        base: TypeId,
        len: u32,
    },
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        variadic: bool,
    },
    Struct {
        name: String,
        members: Vec<MemberType>,
    },
    Union {
        name: String,
        members: Vec<MemberType>,
    },
}

#[derive(Debug, Clone)]
pub struct MemberType {
    pub name: String,
    pub ty: TypeId,
    pub pos: Pos,
}

/// Name key for an interned type, tagged by namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    /// Typedef name.
    Plain(String),
    Struct(String),
    Union(String),
}

impl std::fmt::Display for TypeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeKey::Plain(name) => write!(f, "{name}"),
            TypeKey::Struct(name) => write!(f, "struct {name}"),
            TypeKey::Union(name) => write!(f, "union {name}"),
        }
    }
}

/// Computed memory layout of a struct or union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub size: u32,
    pub align: u32,
    /// Byte offset of each member, parallel to the member list.
    pub offsets: Vec<u32>,
}

/// Per-compilation interner of types with ILP32 sizes and alignments.
#[derive(Debug)]
pub struct TypeTable {
    types: Vec<Type>,
    named: IndexMap<TypeKey, TypeId>,
    pointer_cache: HashMap<TypeId, TypeId>,
    array_cache: HashMap<(TypeId, u32), TypeId>,
    layouts: HashMap<TypeId, Layout>,

    void_id: TypeId,
    char_id: TypeId,
    uchar_id: TypeId,
    short_id: TypeId,
    ushort_id: TypeId,
    int_id: TypeId,
    uint_id: TypeId,
    long_id: TypeId,
    ulong_id: TypeId,
}

const POINTER_SIZE: u32 = 4;

impl TypeTable {
    /// Builds a table populated with the ILP32 primitive types.
    pub fn ilp32() -> Self {
        let mut table = TypeTable {
            types: vec![],
            named: IndexMap::new(),
            pointer_cache: HashMap::new(),
            array_cache: HashMap::new(),
            layouts: HashMap::new(),
            void_id: TypeId(0),
            char_id: TypeId(0),
            uchar_id: TypeId(0),
            short_id: TypeId(0),
            ushort_id: TypeId(0),
            int_id: TypeId(0),
            uint_id: TypeId(0),
            long_id: TypeId(0),
            ulong_id: TypeId(0),
        };

        table.void_id = table.intern(Type::Void);
        table.char_id = table.intern(Type::Integer {
            size: 1,
            signed: true,
            name: "char",
        });
        table.uchar_id = table.intern(Type::Integer {
            size: 1,
            signed: false,
            name: "unsigned char",
        });
        table.short_id = table.intern(Type::Integer {
            size: 2,
            signed: true,
            name: "short",
        });
        table.ushort_id = table.intern(Type::Integer {
            size: 2,
            signed: false,
            name: "unsigned short",
        });
        table.int_id = table.intern(Type::Integer {
            size: 4,
            signed: true,
            name: "int",
        });
        table.uint_id = table.intern(Type::Integer {
            size: 4,
            signed: false,
            name: "unsigned int",
        });
        table.long_id = table.intern(Type::Integer {
            size: 4,
            signed: true,
            name: "long",
        });
        table.ulong_id = table.intern(Type::Integer {
            size: 4,
            signed: false,
            name: "unsigned long",
        });

        table
    }

    pub fn void(&self) -> TypeId {
        self.void_id
    }
    pub fn char(&self) -> TypeId {
        self.char_id
    }
    pub fn uchar(&self) -> TypeId {
        self.uchar_id
    }
    pub fn short(&self) -> TypeId {
        self.short_id
    }
    pub fn ushort(&self) -> TypeId {
        self.ushort_id
    }
    pub fn int(&self) -> TypeId {
        self.int_id
    }
    pub fn uint(&self) -> TypeId {
        self.uint_id
    }
    pub fn long(&self) -> TypeId {
        self.long_id
    }
    pub fn ulong(&self) -> TypeId {
        self.ulong_id
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    fn intern(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    /// Returns the pointer type to `base`, interning it on first use.
    pub fn pointer_to(&mut self, base: TypeId) -> TypeId {
        if let Some(id) = self.pointer_cache.get(&base) {
            return *id;
        }
        let id = self.intern(Type::Pointer { base });
        self.pointer_cache.insert(base, id);
        id
    }

    /// Returns the array type `base[len]`, interning it on first use.
    pub fn array_of(&mut self, base: TypeId, len: u32) -> TypeId {
        if let Some(id) = self.array_cache.get(&(base, len)) {
            return *id;
        }
        let id = self.intern(Type::Array { base, len });
        self.array_cache.insert((base, len), id);
        id
    }

    pub fn function(&mut self, ret: TypeId, params: Vec<TypeId>, variadic: bool) -> TypeId {
        self.intern(Type::Function {
            ret,
            params,
            variadic,
        })
    }

    /// Registers a struct/union definition under its tagged key.
    pub fn define_composite(&mut self, key: TypeKey, ty: Type) -> TypeId {
        let id = self.intern(ty);
        self.named.insert(key, id);
        id
    }

    /// Registers a typedef. Chains are flattened: the alias maps straight to
    /// the underlying type id.
    pub fn define_alias(&mut self, name: String, target: TypeId) {
        self.named.insert(TypeKey::Plain(name), target);
    }

    /// Fills in the members of a registered struct/union shell.
    pub fn set_members(&mut self, id: TypeId, new_members: Vec<MemberType>) {
        if let Type::Struct { members, .. } | Type::Union { members, .. } =
            &mut self.types[id.0 as usize]
        {
            *members = new_members;
        }
    }

    pub fn lookup(&self, key: &TypeKey) -> Option<TypeId> {
        self.named.get(key).copied()
    }

    pub fn is_defined(&self, key: &TypeKey) -> bool {
        self.named.contains_key(key)
    }

    /// Size in bytes, or `None` for incomplete types (`void`, functions).
    pub fn size_of(&self, id: TypeId) -> Option<u32> {
        match self.get(id) {
            Type::Void => None,
            Type::Integer { size, .. } => Some(*size),
            Type::Pointer { .. } => Some(POINTER_SIZE),
            Type::Array { base, len } => Some(self.size_of(*base)? * len),
            Type::Function { .. } => None,
            Type::Struct { .. } | Type::Union { .. } => {
                self.layout_uncached(id).map(|layout| layout.size)
            }
        }
    }

    pub fn align_of(&self, id: TypeId) -> Option<u32> {
        match self.get(id) {
            Type::Void => None,
            Type::Integer { size, .. } => Some(*size),
            Type::Pointer { .. } => Some(POINTER_SIZE),
            Type::Array { base, .. } => self.align_of(*base),
            Type::Function { .. } => None,
            Type::Struct { .. } | Type::Union { .. } => {
                self.layout_uncached(id).map(|layout| layout.align)
            }
        }
    }

    /// Computes the layout of a struct/union: members at declaration order,
    /// each aligned to its own alignment; struct size padded up to the
    /// maximum member alignment; union size is the maximum member size.
    fn layout_uncached(&self, id: TypeId) -> Option<Layout> {
        if let Some(layout) = self.layouts.get(&id) {
            return Some(layout.clone());
        }

        match self.get(id) {
            Type::Struct { members, .. } => {
                let mut offsets = vec![];
                let mut offset = 0u32;
                let mut align = 1u32;

                for member in members {
                    let m_size = self.size_of(member.ty)?;
                    let m_align = self.align_of(member.ty)?;
                    offset = offset.next_multiple_of(m_align);
                    offsets.push(offset);
                    offset += m_size;
                    align = align.max(m_align);
                }

                Some(Layout {
                    size: offset.next_multiple_of(align),
                    align,
                    offsets,
                })
            }
            Type::Union { members, .. } => {
                let mut size = 0u32;
                let mut align = 1u32;

                for member in members {
                    size = size.max(self.size_of(member.ty)?);
                    align = align.max(self.align_of(member.ty)?);
                }

                Some(Layout {
                    size: size.next_multiple_of(align),
                    align,
                    offsets: vec![0; members.len()],
                })
            }
            _ => None,
        }
    }

    /// Cached layout of a struct/union.
    pub fn layout_of(&mut self, id: TypeId) -> Option<Layout> {
        if let Some(layout) = self.layouts.get(&id) {
            return Some(layout.clone());
        }
        let layout = self.layout_uncached(id)?;
        self.layouts.insert(id, layout.clone());
        Some(layout)
    }

    /// Looks up a member of a struct/union by name, returning its byte offset
    /// and type.
    pub fn member_of(&mut self, id: TypeId, name: &str) -> Option<(u32, TypeId)> {
        let layout = self.layout_of(id)?;
        match self.get(id) {
            Type::Struct { members, .. } | Type::Union { members, .. } => members
                .iter()
                .position(|m| m.name == name)
                .map(|i| (layout.offsets[i], members[i].ty)),
            _ => None,
        }
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Integer { .. })
    }

    pub fn is_signed(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Integer { signed: true, .. })
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Pointer { .. })
    }

    pub fn is_array(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Array { .. })
    }

    pub fn is_composite(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Struct { .. } | Type::Union { .. })
    }

    pub fn is_function(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Function { .. })
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Void)
    }

    pub fn is_scalar(&self, id: TypeId) -> bool {
        self.is_integer(id) || self.is_pointer(id)
    }

    /// Pointee of a pointer, element of an array.
    pub fn base_of(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id) {
            Type::Pointer { base } | Type::Array { base, .. } => Some(*base),
            _ => None,
        }
    }

    /// Integer promotion: operands narrower than `int` widen to `int` (all
    /// narrow values fit in a 32-bit `int` on ILP32).
    pub fn promote(&self, id: TypeId) -> TypeId {
        match self.get(id) {
            Type::Integer { size, .. } if *size < 4 => self.int_id,
            _ => id,
        }
    }

    /// Usual arithmetic conversion of two promoted integer types: the wider
    /// type wins; on a width tie, unsigned wins.
    pub fn usual_arith(&self, lhs: TypeId, rhs: TypeId) -> TypeId {
        let (Type::Integer { size: ls, signed: lsig, .. }, Type::Integer { size: rs, signed: rsig, .. }) =
            (self.get(lhs), self.get(rhs))
        else {
            return lhs;
        };

        match ls.cmp(rs) {
            std::cmp::Ordering::Greater => lhs,
            std::cmp::Ordering::Less => rhs,
            std::cmp::Ordering::Equal => {
                if *lsig && !*rsig {
                    rhs
                } else if !*lsig && *rsig {
                    lhs
                } else {
                    lhs
                }
            }
        }
    }

    /// Structural type equality; structs and unions compare nominally.
    pub fn same_type(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Type::Void, Type::Void) => true,
            (
                Type::Integer { size: s1, signed: g1, .. },
                Type::Integer { size: s2, signed: g2, .. },
            ) => s1 == s2 && g1 == g2,
            (Type::Pointer { base: b1 }, Type::Pointer { base: b2 }) => self.same_type(*b1, *b2),
            (Type::Array { base: b1, len: l1 }, Type::Array { base: b2, len: l2 }) => {
                l1 == l2 && self.same_type(*b1, *b2)
            }
            (
                Type::Function { ret: r1, params: p1, variadic: v1 },
                Type::Function { ret: r2, params: p2, variadic: v2 },
            ) => {
                v1 == v2
                    && self.same_type(*r1, *r2)
                    && p1.len() == p2.len()
                    && p1.iter().zip(p2).all(|(x, y)| self.same_type(*x, *y))
            }
            _ => false,
        }
    }

    /// Human-readable type name for diagnostics.
    pub fn name_of(&self, id: TypeId) -> String {
        match self.get(id) {
            Type::Void => "void".into(),
            Type::Integer { name, .. } => (*name).into(),
            Type::Pointer { base } => format!("{}*", self.name_of(*base)),
            Type::Array { base, len } => format!("{}[{len}]", self.name_of(*base)),
            Type::Function { ret, .. } => format!("{}()", self.name_of(*ret)),
            Type::Struct { name, .. } => format!("struct {name}"),
            Type::Union { name, .. } => format!("union {name}"),
        }
    }

    /// Table-wide semantic check, run once after type resolution:
    ///
    /// - no struct/union contains a value of itself, directly or through
    ///   other composite members (pointers break the cycle);
    /// - no duplicate member names within one definition.
    pub fn semantic_check(&self, diag: &mut Diagnostics) {
        for (key, id) in &self.named {
            let (Type::Struct { members, .. } | Type::Union { members, .. }) = self.get(*id)
            else {
                continue;
            };

            let mut seen = HashSet::new();
            for member in members {
                if !seen.insert(member.name.as_str()) {
                    diag.error(
                        member.pos,
                        format!("duplicate member '{}' in {key}", member.name),
                    );
                }
            }

            let mut visiting = HashSet::new();
            if self.contains_value_of(*id, *id, &mut visiting) {
                let pos = members.first().map(|m| m.pos);
                let msg = format!("recursive type definition: {key}");
                match pos {
                    Some(pos) => diag.error(pos, msg),
                    None => diag.error_no_pos(msg),
                }
            }
        }
    }

    /// Does `id` transitively contain a value (not a pointer) of `target`?
    fn contains_value_of(
        &self,
        id: TypeId,
        target: TypeId,
        visiting: &mut HashSet<TypeId>,
    ) -> bool {
        if !visiting.insert(id) {
            return false;
        }

        let members = match self.get(id) {
            Type::Struct { members, .. } | Type::Union { members, .. } => members,
            _ => return false,
        };

        for member in members {
            let mut ty = member.ty;
            // Arrays of T contain values of T.
            while let Type::Array { base, .. } = self.get(ty) {
                ty = *base;
            }
            if ty == target {
                return true;
            }
            if self.is_composite(ty) && self.contains_value_of(ty, target, visiting) {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn pos() -> Pos {
        Pos::new(Path::new("test.cb"), 1, 0)
    }

    fn member(name: &str, ty: TypeId) -> MemberType {
        MemberType {
            name: name.into(),
            ty,
            pos: pos(),
        }
    }

    #[test]
    fn ilp32_primitive_sizes() {
        let table = TypeTable::ilp32();
        assert_eq!(table.size_of(table.char()), Some(1));
        assert_eq!(table.size_of(table.short()), Some(2));
        assert_eq!(table.size_of(table.int()), Some(4));
        assert_eq!(table.size_of(table.long()), Some(4));
        assert_eq!(table.size_of(table.void()), None);
    }

    #[test]
    fn pointer_and_array_sizes() {
        let mut table = TypeTable::ilp32();
        let p = table.pointer_to(table.char());
        assert_eq!(table.size_of(p), Some(4));

        let a = table.array_of(table.short(), 5);
        assert_eq!(table.size_of(a), Some(10));
        assert_eq!(table.align_of(a), Some(2));
    }

    #[test]
    fn pointer_types_are_interned() {
        let mut table = TypeTable::ilp32();
        let p1 = table.pointer_to(table.int());
        let p2 = table.pointer_to(table.int());
        assert_eq!(p1, p2);
    }

    #[test]
    fn struct_layout_aligns_members() {
        let mut table = TypeTable::ilp32();
        let members = vec![
            member("c", table.char()),
            member("n", table.int()),
            member("s", table.short()),
        ];
        let id = table.define_composite(
            TypeKey::Struct("mixed".into()),
            Type::Struct {
                name: "mixed".into(),
                members,
            },
        );

        let layout = table.layout_of(id).expect("layout");
        assert_eq!(layout.offsets, [0, 4, 8]);
        // Padded up to the 4-byte member alignment.
        assert_eq!(layout.size, 12);
        assert_eq!(layout.align, 4);
    }

    #[test]
    fn layout_is_deterministic() {
        let mut table = TypeTable::ilp32();
        let members = vec![member("a", table.char()), member("b", table.long())];
        let id = table.define_composite(
            TypeKey::Struct("p".into()),
            Type::Struct {
                name: "p".into(),
                members,
            },
        );

        let first = table.layout_of(id).expect("layout");
        let second = table.layout_of(id).expect("layout");
        assert_eq!(first, second);
    }

    #[test]
    fn union_layout_takes_maximum() {
        let mut table = TypeTable::ilp32();
        let arr = table.array_of(table.char(), 7);
        let members = vec![member("n", table.int()), member("bytes", arr)];
        let id = table.define_composite(
            TypeKey::Union("u".into()),
            Type::Union {
                name: "u".into(),
                members,
            },
        );

        let layout = table.layout_of(id).expect("layout");
        assert_eq!(layout.align, 4);
        assert_eq!(layout.size, 8);
        assert_eq!(layout.offsets, [0, 0]);
    }

    #[test]
    fn promotion_widens_narrow_integers() {
        let table = TypeTable::ilp32();
        assert_eq!(table.promote(table.char()), table.int());
        assert_eq!(table.promote(table.ushort()), table.int());
        assert_eq!(table.promote(table.uint()), table.uint());
    }

    #[test]
    fn usual_arith_prefers_unsigned_on_tie() {
        let table = TypeTable::ilp32();
        assert_eq!(
            table.usual_arith(table.int(), table.uint()),
            table.uint()
        );
        assert_eq!(table.usual_arith(table.int(), table.int()), table.int());
    }

    #[test]
    fn self_reference_through_pointer_is_fine() {
        let mut table = TypeTable::ilp32();
        // struct node { struct node *next; } modeled by defining the struct
        // first and patching the member type through a pointer.
        let id = table.define_composite(
            TypeKey::Struct("node".into()),
            Type::Struct {
                name: "node".into(),
                members: vec![],
            },
        );
        let next = table.pointer_to(id);
        if let Type::Struct { members, .. } = &mut table.types[id.0 as usize] {
            members.push(MemberType {
                name: "next".into(),
                ty: next,
                pos: pos(),
            });
        }

        let mut diag = Diagnostics::new();
        table.semantic_check(&mut diag);
        assert_eq!(diag.error_count(), 0);
    }

    #[test]
    fn direct_self_containment_is_recursive() {
        let mut table = TypeTable::ilp32();
        let id = table.define_composite(
            TypeKey::Struct("bad".into()),
            Type::Struct {
                name: "bad".into(),
                members: vec![],
            },
        );
        if let Type::Struct { members, .. } = &mut table.types[id.0 as usize] {
            members.push(MemberType {
                name: "inner".into(),
                ty: id,
                pos: pos(),
            });
        }

        let mut diag = Diagnostics::new();
        table.semantic_check(&mut diag);
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn duplicate_members_are_rejected() {
        let mut table = TypeTable::ilp32();
        let members = vec![member("x", table.int()), member("x", table.int())];
        table.define_composite(
            TypeKey::Struct("dup".into()),
            Type::Struct {
                name: "dup".into(),
                members,
            },
        );

        let mut diag = Diagnostics::new();
        table.semantic_check(&mut diag);
        assert_eq!(diag.error_count(), 1);
    }
}

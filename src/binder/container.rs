//! Array and struct binders.

use std::sync::Arc;

use super::{mismatch, Binder};
use crate::error::BinderError;
use crate::protocol::{DbusValue, TypeSignature};

pub struct ArrayBinder<T> {
    element: Arc<dyn Binder<T>>,
}

impl<T> ArrayBinder<T> {
    pub fn new(element: Arc<dyn Binder<T>>) -> Self {
        Self { element }
    }
}

impl<T> Binder<Vec<T>> for ArrayBinder<T> {
    fn type_signature(&self) -> TypeSignature {
        TypeSignature::array(self.element.type_signature())
    }

    fn decode(&self, value: &DbusValue) -> Result<Vec<T>, BinderError> {
        match value.inner() {
            DbusValue::Array { items, .. } => items.iter().map(|i| self.element.decode(i)).collect(),
            other => Err(mismatch(&self.type_signature(), other)),
        }
    }

    fn encode(&self, value: &Vec<T>) -> Result<DbusValue, BinderError> {
        let items = value
            .iter()
            .map(|v| self.element.encode(v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DbusValue::array(self.element.type_signature(), items)?)
    }
}

type Getter<T> = Box<dyn Fn(&T) -> Result<DbusValue, BinderError> + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, &DbusValue) -> Result<(), BinderError> + Send + Sync>;

struct Member<T> {
    signature: TypeSignature,
    get: Getter<T>,
    set: Setter<T>,
}

/// Binds a Rust struct to a wire STRUCT through an explicit member list,
/// in wire order.
pub struct StructBinder<T> {
    signature: TypeSignature,
    members: Vec<Member<T>>,
    construct: Box<dyn Fn() -> T + Send + Sync>,
}

pub struct StructBinderBuilder<T> {
    members: Vec<Member<T>>,
    construct: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: 'static> StructBinder<T> {
    /// `construct` yields the blank value that decoded members are set on.
    pub fn builder<C>(construct: C) -> StructBinderBuilder<T>
    where
        C: Fn() -> T + Send + Sync + 'static,
    {
        StructBinderBuilder {
            members: Vec::new(),
            construct: Box::new(construct),
        }
    }
}

impl<T: 'static> StructBinderBuilder<T> {
    #[must_use]
    pub fn member<M: 'static>(
        mut self,
        binder: Arc<dyn Binder<M>>,
        get: fn(&T) -> &M,
        set: fn(&mut T, M),
    ) -> Self {
        let signature = binder.type_signature();
        let encoder = Arc::clone(&binder);
        self.members.push(Member {
            signature,
            get: Box::new(move |t| encoder.encode(get(t))),
            set: Box::new(move |t, v| {
                set(t, binder.decode(v)?);
                Ok(())
            }),
        });
        self
    }

    pub fn build(self) -> Result<StructBinder<T>, BinderError> {
        if self.members.is_empty() {
            return Err(BinderError::EmptyStruct);
        }
        let signature = TypeSignature::Struct(
            self.members.iter().map(|m| m.signature.clone()).collect(),
        );
        Ok(StructBinder {
            signature,
            members: self.members,
            construct: self.construct,
        })
    }
}

impl<T> Binder<T> for StructBinder<T> {
    fn type_signature(&self) -> TypeSignature {
        self.signature.clone()
    }

    fn decode(&self, value: &DbusValue) -> Result<T, BinderError> {
        let DbusValue::Struct(items) = value.inner() else {
            return Err(mismatch(&self.signature, value));
        };
        if items.len() != self.members.len() {
            return Err(BinderError::MemberCount {
                expected: self.members.len(),
                found: items.len(),
            });
        }
        let mut out = (self.construct)();
        for (member, item) in self.members.iter().zip(items) {
            (member.set)(&mut out, item)?;
        }
        Ok(out)
    }

    fn encode(&self, value: &T) -> Result<DbusValue, BinderError> {
        let mut items = Vec::with_capacity(self.members.len());
        for member in &self.members {
            items.push((member.get)(value)?);
        }
        Ok(DbusValue::Struct(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::PrimitiveBinder;

    #[derive(Debug, Default, PartialEq)]
    struct Entry {
        name: String,
        size: u64,
    }

    fn entry_binder() -> StructBinder<Entry> {
        StructBinder::builder(Entry::default)
            .member::<String>(
                Arc::new(PrimitiveBinder::<String>::default()),
                |e| &e.name,
                |e, v| e.name = v,
            )
            .member::<u64>(
                Arc::new(PrimitiveBinder::<u64>::default()),
                |e| &e.size,
                |e, v| e.size = v,
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_struct_members_in_order() {
        let binder = entry_binder();
        assert_eq!(binder.type_signature().serialize(), "(st)");

        let value = Entry {
            name: "a".into(),
            size: 3,
        };
        let wire = binder.encode(&value).unwrap();
        assert_eq!(
            wire,
            DbusValue::Struct(vec![DbusValue::string("a"), DbusValue::Uint64(3)])
        );
        assert_eq!(binder.decode(&wire).unwrap(), value);
    }

    #[test]
    fn test_struct_member_count_checked() {
        let binder = entry_binder();
        let short = DbusValue::Struct(vec![DbusValue::string("a")]);
        assert_eq!(
            binder.decode(&short).unwrap_err(),
            BinderError::MemberCount {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_empty_struct_rejected() {
        let result = StructBinder::<Entry>::builder(Entry::default).build();
        assert!(matches!(result, Err(BinderError::EmptyStruct)));
    }

    #[test]
    fn test_array_of_structs() {
        let binder = ArrayBinder::new(Arc::new(entry_binder()) as Arc<dyn Binder<Entry>>);
        assert_eq!(binder.type_signature().serialize(), "a(st)");

        let values = vec![Entry::default(), Entry { name: "z".into(), size: 9 }];
        let wire = binder.encode(&values).unwrap();
        assert_eq!(binder.decode(&wire).unwrap(), values);
    }
}

//! Binder lookup by Rust type
//!
//! Registered factories are asked first, most recently added first; types
//! none of them claim fall back to their [`Bindable`] built-in. Results are
//! memoized per type.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use super::{Bindable, Binder};
use crate::core::MemoizingCache;
use crate::error::BinderError;

/// An `Arc<dyn Binder<T>>` with `T` erased.
pub type ErasedBinder = Arc<dyn Any + Send + Sync>;

pub trait BinderFactory: Send + Sync {
    /// Binder for the type behind `type_id`, if this factory handles it.
    /// The returned value must hold an `Arc<dyn Binder<T>>` for that type.
    fn binder_for(&self, type_id: TypeId) -> Option<ErasedBinder>;
}

/// Factory serving one fixed binder for one type.
pub struct TypedFactory<T: 'static> {
    binder: Arc<dyn Binder<T>>,
}

impl<T: 'static> TypedFactory<T> {
    pub fn new(binder: Arc<dyn Binder<T>>) -> Self {
        Self { binder }
    }
}

impl<T: 'static> BinderFactory for TypedFactory<T> {
    fn binder_for(&self, type_id: TypeId) -> Option<ErasedBinder> {
        if type_id == TypeId::of::<T>() {
            Some(Arc::new(Arc::clone(&self.binder)))
        } else {
            None
        }
    }
}

#[derive(Default)]
pub struct BinderRegistry {
    factories: Vec<Arc<dyn BinderFactory>>,
    cache: MemoizingCache<TypeId, ErasedBinder>,
}

impl BinderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory ahead of every one added before it. Memoized lookups
    /// are dropped so the new factory is consulted on the next call.
    pub fn add_factory(&mut self, factory: Arc<dyn BinderFactory>) {
        self.factories.insert(0, factory);
        self.cache = MemoizingCache::new();
    }

    pub fn register<T: 'static>(&mut self, binder: Arc<dyn Binder<T>>) {
        self.add_factory(Arc::new(TypedFactory::new(binder)));
    }

    /// Binder for `T`: factories first, then the built-in.
    pub fn binder<T: Bindable>(&self) -> Result<Arc<dyn Binder<T>>, BinderError> {
        let erased = self.cache.try_compute_if_absent(TypeId::of::<T>(), |_| {
            self.resolve_uncached::<T>()
                .map(|b| Arc::new(b) as ErasedBinder)
        })?;
        downcast::<T>(erased)
    }

    /// Binder for a type that only factories know about.
    pub fn registered_binder<T: 'static>(&self) -> Result<Arc<dyn Binder<T>>, BinderError> {
        let erased = self.cache.try_compute_if_absent(TypeId::of::<T>(), |id| {
            self.from_factories(*id)
                .ok_or(BinderError::NoBinder(type_name::<T>()))
        })?;
        downcast::<T>(erased)
    }

    /// Lookup without touching the cache. Built-ins that need a nested
    /// binder go through here; the cache lock is held while they run.
    pub fn resolve_uncached<T: Bindable>(&self) -> Result<Arc<dyn Binder<T>>, BinderError> {
        match self.from_factories(TypeId::of::<T>()) {
            Some(erased) => downcast::<T>(erased),
            None => T::builtin_binder(self),
        }
    }

    fn from_factories(&self, type_id: TypeId) -> Option<ErasedBinder> {
        self.factories.iter().find_map(|f| f.binder_for(type_id))
    }
}

fn downcast<T: 'static>(erased: ErasedBinder) -> Result<Arc<dyn Binder<T>>, BinderError> {
    erased
        .downcast::<Arc<dyn Binder<T>>>()
        .map(|b| Arc::clone(b.as_ref()))
        .map_err(|_| BinderError::NoBinder(type_name::<T>()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{FnBinder, StructBinder};
    use crate::protocol::{BasicType, DbusValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builtins_and_arrays() {
        let registry = BinderRegistry::new();
        let b = registry.binder::<Vec<u32>>().unwrap();
        assert_eq!(b.type_signature().serialize(), "au");

        let wire = b.encode(&vec![1, 2]).unwrap();
        assert_eq!(b.decode(&wire).unwrap(), vec![1, 2]);

        let nested = registry.binder::<Vec<Vec<String>>>().unwrap();
        assert_eq!(nested.type_signature().serialize(), "aas");
    }

    #[test]
    fn test_registered_binder_wins() {
        let mut registry = BinderRegistry::new();
        // u32 carried as a string
        registry.register::<u32>(Arc::new(FnBinder::new(
            BasicType::String,
            |v| v.as_str().and_then(|s| s.parse::<u32>().ok()),
            |n: &u32| DbusValue::string(n.to_string()),
        )));

        let b = registry.binder::<u32>().unwrap();
        assert_eq!(b.encode(&7).unwrap(), DbusValue::string("7"));
        // element lookups see the override too
        let arr = registry.binder::<Vec<u32>>().unwrap();
        assert_eq!(arr.type_signature().serialize(), "as");
    }

    #[derive(Default, Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_struct_via_registry() {
        let mut registry = BinderRegistry::new();
        assert!(matches!(
            registry.registered_binder::<Point>(),
            Err(BinderError::NoBinder(_))
        ));

        let int = registry.binder::<i32>().unwrap();
        let point = StructBinder::builder(Point::default)
            .member(Arc::clone(&int), |p| &p.x, |p, v| p.x = v)
            .member(int, |p| &p.y, |p, v| p.y = v)
            .build()
            .unwrap();
        registry.register::<Point>(Arc::new(point));

        let b = registry.registered_binder::<Point>().unwrap();
        assert_eq!(b.type_signature().serialize(), "(ii)");
        let wire = b.encode(&Point { x: 1, y: -1 }).unwrap();
        assert_eq!(b.decode(&wire).unwrap(), Point { x: 1, y: -1 });
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl BinderFactory for Counting {
        fn binder_for(&self, _type_id: TypeId) -> Option<ErasedBinder> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn test_lookups_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = BinderRegistry::new();
        registry.add_factory(Arc::new(Counting {
            calls: Arc::clone(&calls),
        }));

        registry.binder::<bool>().unwrap();
        registry.binder::<bool>().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_lookup_takes_effect() {
        let mut registry = BinderRegistry::new();
        let before = registry.binder::<u32>().unwrap();
        assert_eq!(before.type_signature().serialize(), "u");
        let array_before = registry.binder::<Vec<u32>>().unwrap();
        assert_eq!(array_before.type_signature().serialize(), "au");

        registry.register::<u32>(Arc::new(FnBinder::new(
            BasicType::String,
            |v| v.as_str().and_then(|s| s.parse::<u32>().ok()),
            |n: &u32| DbusValue::string(n.to_string()),
        )));

        let after = registry.binder::<u32>().unwrap();
        assert_eq!(after.type_signature().serialize(), "s");
        assert_eq!(after.encode(&3).unwrap(), DbusValue::string("3"));
        // binders built on the old element binder are rebuilt too
        let array_after = registry.binder::<Vec<u32>>().unwrap();
        assert_eq!(array_after.type_signature().serialize(), "as");
    }
}

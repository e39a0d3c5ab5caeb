//! Keyed Context
//!
//! Context carries values down the owner tree without threading them
//! through every call. Keys are identity-distinct tokens minted by
//! [`create_context`]; lookups walk up the parent chain, writes touch the
//! current scope only.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::errors::{ContextNotFoundError, NoOwnerError};

use super::owner;

thread_local! {
    static CONTEXT_KEY_COUNTER: Cell<u64> = const { Cell::new(0) };
}

/// An identity token for a context slot holding values of type `T`.
///
/// Two calls to [`create_context`] always produce distinct tokens, even for
/// the same type; equality of the token is what links providers to readers.
pub struct Context<T> {
    key: u64,
    default: Option<Rc<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            default: self.default.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("key", &self.key)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Mint a new context token, optionally with a default used when no
/// provider is found on the owner chain.
pub fn create_context<T>(default: Option<T>) -> Context<T> {
    let key = CONTEXT_KEY_COUNTER.with(|counter| {
        let key = counter.get();
        counter.set(key + 1);
        key
    });
    Context {
        key,
        default: default.map(Rc::new),
        _marker: PhantomData,
    }
}

/// Provide a value for `context` on the current scope.
pub fn set_context<T: 'static>(context: &Context<T>, value: T) -> Result<(), NoOwnerError> {
    owner::context_insert(context.key, Rc::new(value) as Rc<dyn Any>)
}

/// Look `context` up, walking the owner chain, falling back to the default.
pub fn get_context<T: Clone + 'static>(context: &Context<T>) -> Result<T, ContextNotFoundError> {
    if let Some(value) = owner::context_lookup(context.key) {
        if let Ok(typed) = value.downcast::<T>() {
            return Ok((*typed).clone());
        }
    }
    match &context.default {
        Some(default) => Ok((**default).clone()),
        None => Err(ContextNotFoundError),
    }
}

/// True when a provider for `context` exists on the owner chain.
pub fn has_context<T>(context: &Context<T>) -> bool {
    owner::context_lookup(context.key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::owner::{create_root, create_scope, enter_scope};

    #[test]
    fn lookup_walks_the_owner_chain() {
        let theme = create_context::<&'static str>(None);
        create_root(|root| {
            set_context(&theme, "dark").unwrap();
            let child = create_scope(None, false);
            let _guard = enter_scope(child);
            assert_eq!(get_context(&theme).unwrap(), "dark");
            drop(_guard);
            root.dispose();
        });
    }

    #[test]
    fn writes_shadow_only_below_the_writer() {
        let level = create_context::<i32>(None);
        create_root(|root| {
            set_context(&level, 1).unwrap();
            let child = create_scope(None, false);
            {
                let _guard = enter_scope(child);
                set_context(&level, 2).unwrap();
                assert_eq!(get_context(&level).unwrap(), 2);
            }
            assert_eq!(get_context(&level).unwrap(), 1);
            root.dispose();
        });
    }

    #[test]
    fn missing_context_falls_back_to_default_or_errors() {
        let with_default = create_context(Some(7));
        let without_default = create_context::<i32>(None);
        create_root(|root| {
            assert_eq!(get_context(&with_default).unwrap(), 7);
            assert!(get_context(&without_default).is_err());
            assert!(!has_context(&without_default));
            root.dispose();
        });
    }

    #[test]
    fn distinct_tokens_do_not_alias() {
        let a = create_context::<i32>(None);
        let b = create_context::<i32>(None);
        create_root(|root| {
            set_context(&a, 1).unwrap();
            assert!(has_context(&a));
            assert!(!has_context(&b));
            root.dispose();
        });
    }

    #[test]
    fn set_context_without_owner_errors() {
        let ctx = create_context::<i32>(None);
        assert!(set_context(&ctx, 1).is_err());
    }
}

// Control-query subsystem: a dotted-path registry of handlers taking an
// opaque argument. The log core forwards queries here without interpreting
// either the path or the argument.
use std::any::Any;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryKind {
    Read,
    Write,
    Exec,
}

type Handler = Box<dyn Fn(QueryKind, &mut dyn Any) -> Result<(), Error> + Send + Sync>;

/// One registry instance per scope. A pool handle owns one for pool-scoped
/// queries; callers wanting process-wide queries own their own instance
/// instead of this crate holding ambient global state.
#[derive(Default)]
pub struct Ctl {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Ctl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        handler: impl Fn(QueryKind, &mut dyn Any) -> Result<(), Error> + Send + Sync + 'static,
    ) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        handlers.insert(name.into(), Box::new(handler));
    }

    pub fn query(&self, kind: QueryKind, name: &str, arg: &mut dyn Any) -> Result<(), Error> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let handler = handlers.get(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("unknown ctl query {name}"))
        })?;
        handler(kind, arg)
    }
}

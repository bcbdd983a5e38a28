//! # binding
//!
//! A [`Binding`] links the value stored at one path to one consumer-owned
//! target. Value-setters write into a [`BoundValue`] slot, building the new
//! value with the [`CreateStrategy`] chosen at registration; invokers hand the
//! raw string to a callback.
use std::{
    any::{Any, type_name},
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{BindError, BindResult};
use crate::metrics;

/// boxed error returned by constructors and invokers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// string constructor of a bindable type, resolved once at registration
pub type Constructor<T> = Arc<dyn Fn(&str) -> Result<T, BoxError> + Send + Sync>;

/// callback of an invoker binding, receives the raw string
pub type Invoker = Arc<dyn Fn(&str) -> Result<(), BoxError> + Send + Sync>;

/// when a path's value is read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscribeType {
    /// read once at startup, never re-synchronized
    #[default]
    None,
    /// kept live with a watch
    DataChange,
}

/// how a raw string becomes the value written into a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateStrategy {
    /// pass the raw string through, invokers only
    None,
    /// build the value with the target type's string constructor
    #[default]
    ConstructFromString,
    /// the raw string names an object in the [`Dependencies`] registry
    LookupByName,
}

impl fmt::Display for SubscribeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeType::None => write!(f, "NONE"),
            SubscribeType::DataChange => write!(f, "DATA_CHANGE"),
        }
    }
}

impl fmt::Display for CreateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateStrategy::None => write!(f, "NONE"),
            CreateStrategy::ConstructFromString => write!(f, "CONSTRUCT_FROM_STRING"),
            CreateStrategy::LookupByName => write!(f, "LOOKUP_BY_NAME"),
        }
    }
}

impl From<config::SubscribeMode> for SubscribeType {
    fn from(mode: config::SubscribeMode) -> Self {
        match mode {
            config::SubscribeMode::None => SubscribeType::None,
            config::SubscribeMode::DataChange => SubscribeType::DataChange,
        }
    }
}

impl From<config::CreateMode> for CreateStrategy {
    fn from(mode: config::CreateMode) -> Self {
        match mode {
            config::CreateMode::None => CreateStrategy::None,
            config::CreateMode::Construct => CreateStrategy::ConstructFromString,
            config::CreateMode::Lookup => CreateStrategy::LookupByName,
        }
    }
}

/// A type that can live in a [`BoundValue`] slot.
///
/// Types with a string constructor return it from [`Bindable::constructor`]
/// and can be bound with [`CreateStrategy::ConstructFromString`]. Every
/// bindable type can be bound with [`CreateStrategy::LookupByName`].
pub trait Bindable: Any + Clone + Send + Sync + fmt::Debug {
    /// string constructor of this type, `None` if it has none
    fn constructor() -> Option<Constructor<Self>> {
        None
    }
}

macro_rules! from_str_bindable {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Bindable for $ty {
                fn constructor() -> Option<Constructor<Self>> {
                    Some(Arc::new(|raw: &str| raw.parse::<$ty>().map_err(Into::into)))
                }
            }
        )*
    };
}

from_str_bindable!(
    String, bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32,
    f64, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, PathBuf,
);

impl Bindable for Duration {
    fn constructor() -> Option<Constructor<Self>> {
        Some(Arc::new(|raw: &str| {
            config::wire::parse_duration(raw).map_err(Into::into)
        }))
    }
}

/// Shared slot written by a value-setter binding.
///
/// Clones share the slot. A write is visible to every reader as soon as it
/// returns.
#[derive(Clone)]
pub struct BoundValue<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: fmt::Debug> fmt::Debug for BoundValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoundValue").field(&*self.tx.borrow()).finish()
    }
}

impl<T: Clone> Default for BoundValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> BoundValue<T> {
    /// empty slot
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// slot holding `value`
    pub fn with_value(value: T) -> Self {
        let (tx, _) = watch::channel(Some(value));
        Self { tx: Arc::new(tx) }
    }

    /// current value
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// replace the current value
    pub fn set(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// notified on every write
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.tx.subscribe()
    }
}

impl BoundValue<bool> {
    /// flag is present and `true`
    pub fn is_true(&self) -> bool {
        self.get().unwrap_or(false)
    }
}

/// Named objects that [`CreateStrategy::LookupByName`] bindings resolve
/// against. Lookups read the registry as it is when a value is applied.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

/// result of a [`Dependencies::lookup`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// found with the requested type
    Found(T),
    /// nothing registered under the name
    Missing,
    /// registered, but with another type
    WrongType,
}

impl Dependencies {
    /// empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// register `value` under `name`, replacing any previous object
    pub fn insert<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) {
        self.inner.write().insert(name.into(), Arc::new(value));
    }

    /// remove `name`, returns whether it was registered
    pub fn remove(&self, name: &str) -> bool {
        self.inner.write().remove(name).is_some()
    }

    /// is anything registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// resolve `name` as a `T`
    pub fn lookup<T: Any + Clone>(&self, name: &str) -> Lookup<T> {
        match self.inner.read().get(name) {
            None => Lookup::Missing,
            Some(obj) => match obj.downcast_ref::<T>() {
                Some(value) => Lookup::Found(value.clone()),
                None => Lookup::WrongType,
            },
        }
    }
}

/// Failure to apply a raw value to a target.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// the constructor rejected the raw value
    #[error("cannot construct {type_name} from {value:?}: {source}")]
    Construct {
        /// target type
        type_name: &'static str,
        /// raw value
        value: String,
        /// constructor error
        source: BoxError,
    },
    /// the invoker callback failed
    #[error("invoker failed on {value:?}: {source}")]
    Invoke {
        /// raw value
        value: String,
        /// callback error
        source: BoxError,
    },
    /// the named dependency has another type than the target
    #[error("dependency {name:?} is not a {expected}")]
    TypeMismatch {
        /// dependency name
        name: String,
        /// target type
        expected: &'static str,
    },
}

trait SetValue: Send + Sync + fmt::Debug {
    fn apply(&self, raw: &str) -> Result<(), ApplyError>;
}

struct Construct<T> {
    slot: BoundValue<T>,
    construct: Constructor<T>,
}

impl<T: fmt::Debug> fmt::Debug for Construct<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Construct")
            .field("slot", &self.slot)
            .field("type", &type_name::<T>())
            .finish()
    }
}

impl<T: Bindable> SetValue for Construct<T> {
    fn apply(&self, raw: &str) -> Result<(), ApplyError> {
        let value = (self.construct)(raw).map_err(|source| ApplyError::Construct {
            type_name: type_name::<T>(),
            value: raw.to_owned(),
            source,
        })?;
        self.slot.set(value);
        Ok(())
    }
}

#[derive(Debug)]
struct LookupByName<T> {
    slot: BoundValue<T>,
    deps: Dependencies,
}

impl<T: Bindable> SetValue for LookupByName<T> {
    fn apply(&self, raw: &str) -> Result<(), ApplyError> {
        match self.deps.lookup::<T>(raw) {
            Lookup::Found(value) => {
                self.slot.set(value);
                Ok(())
            }
            Lookup::Missing => {
                metrics::LOOKUP_MISSES.inc();
                warn!(name = raw, "no dependency registered under name, value left unchanged");
                Ok(())
            }
            Lookup::WrongType => Err(ApplyError::TypeMismatch {
                name: raw.to_owned(),
                expected: type_name::<T>(),
            }),
        }
    }
}

#[derive(Clone)]
enum Target {
    Setter(Arc<dyn SetValue>),
    Invoker(Invoker),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Setter(setter) => f.debug_tuple("Setter").field(setter).finish(),
            Target::Invoker(_) => f.write_str("Invoker"),
        }
    }
}

/// One target bound to a path.
#[derive(Debug, Clone)]
pub struct Binding {
    label: String,
    subscribe: SubscribeType,
    strategy: CreateStrategy,
    target: Target,
}

impl Binding {
    /// Bind `slot`. The construction strategy is resolved here, so a type
    /// without a string constructor or a `NONE` strategy fails now rather
    /// than on the first value.
    pub fn value<T: Bindable>(
        label: impl Into<String>,
        slot: BoundValue<T>,
        subscribe: SubscribeType,
        strategy: CreateStrategy,
        deps: &Dependencies,
    ) -> BindResult<Self> {
        let label = label.into();
        let setter: Arc<dyn SetValue> = match strategy {
            CreateStrategy::ConstructFromString => {
                let construct = T::constructor().ok_or_else(|| BindError::NoConstructor {
                    label: label.clone(),
                    type_name: type_name::<T>(),
                })?;
                Arc::new(Construct { slot, construct })
            }
            CreateStrategy::LookupByName => Arc::new(LookupByName {
                slot,
                deps: deps.clone(),
            }),
            CreateStrategy::None => {
                return Err(BindError::UnsupportedStrategy { label, strategy });
            }
        };
        Ok(Self {
            label,
            subscribe,
            strategy,
            target: Target::Setter(setter),
        })
    }

    /// Bind a callback. It receives the raw string whatever the strategy.
    pub fn invoker<F>(
        label: impl Into<String>,
        callback: F,
        subscribe: SubscribeType,
        strategy: CreateStrategy,
    ) -> Self
    where
        F: Fn(&str) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            subscribe,
            strategy,
            target: Target::Invoker(Arc::new(callback)),
        }
    }

    /// label used in logs and errors
    pub fn label(&self) -> &str {
        &self.label
    }

    /// subscription policy
    pub fn subscribe(&self) -> SubscribeType {
        self.subscribe
    }

    /// construction strategy
    pub fn strategy(&self) -> CreateStrategy {
        self.strategy
    }

    /// Apply `raw` to the target.
    pub fn apply(&self, raw: &str) -> Result<(), ApplyError> {
        let res = match &self.target {
            Target::Setter(setter) => setter.apply(raw),
            Target::Invoker(invoke) => invoke(raw).map_err(|source| ApplyError::Invoke {
                value: raw.to_owned(),
                source,
            }),
        };
        match &res {
            Ok(()) => {
                metrics::VALUES_APPLIED.inc();
                debug!(binding = %self.label, value = raw, "applied value");
            }
            Err(_) => metrics::APPLY_ERRORS.inc(),
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tracing_test::traced_test;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Provider(&'static str);

    impl Bindable for Provider {}

    #[test]
    fn test_construct_from_string() {
        let slot = BoundValue::<i32>::new();
        let binding = Binding::value(
            "limit",
            slot.clone(),
            SubscribeType::DataChange,
            CreateStrategy::ConstructFromString,
            &Dependencies::new(),
        )
        .unwrap();
        binding.apply("10").unwrap();
        assert_eq!(slot.get(), Some(10));
        // idempotent
        binding.apply("10").unwrap();
        assert_eq!(slot.get(), Some(10));

        let err = binding.apply("abc").unwrap_err();
        assert!(matches!(err, ApplyError::Construct { ref value, .. } if value == "abc"));
        assert_eq!(slot.get(), Some(10));
    }

    #[test]
    fn test_duration_constructor() {
        let slot = BoundValue::<Duration>::new();
        let binding = Binding::value(
            "timeout",
            slot.clone(),
            SubscribeType::None,
            CreateStrategy::ConstructFromString,
            &Dependencies::new(),
        )
        .unwrap();
        binding.apply("1500ms").unwrap();
        assert_eq!(slot.get(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_no_constructor() {
        let err = Binding::value(
            "phone",
            BoundValue::<Provider>::new(),
            SubscribeType::None,
            CreateStrategy::ConstructFromString,
            &Dependencies::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BindError::NoConstructor { .. }));
    }

    #[test]
    fn test_none_strategy_rejected_for_values() {
        let err = Binding::value(
            "limit",
            BoundValue::<i32>::new(),
            SubscribeType::None,
            CreateStrategy::None,
            &Dependencies::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BindError::UnsupportedStrategy { .. }));
    }

    #[test]
    #[traced_test]
    fn test_lookup_by_name() {
        let deps = Dependencies::new();
        deps.insert("twilio", Provider("twilio"));
        deps.insert("count", 3_u32);

        let slot = BoundValue::<Provider>::new();
        let binding = Binding::value(
            "phone",
            slot.clone(),
            SubscribeType::DataChange,
            CreateStrategy::LookupByName,
            &deps,
        )
        .unwrap();

        binding.apply("twilio").unwrap();
        assert_eq!(slot.get(), Some(Provider("twilio")));

        // missing name leaves the value alone
        binding.apply("nexmo").unwrap();
        assert_eq!(slot.get(), Some(Provider("twilio")));
        assert!(logs_contain("no dependency registered under name"));

        // resolved at apply time
        deps.insert("nexmo", Provider("nexmo"));
        binding.apply("nexmo").unwrap();
        assert_eq!(slot.get(), Some(Provider("nexmo")));

        let err = binding.apply("count").unwrap_err();
        assert!(matches!(err, ApplyError::TypeMismatch { .. }));
    }

    #[test]
    fn test_invoker_gets_raw_string() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let binding = Binding::invoker(
            "provider_changed",
            move |raw: &str| {
                if raw.is_empty() {
                    return Err("empty provider".into());
                }
                sink.lock().unwrap().push(raw.to_owned());
                Ok(())
            },
            SubscribeType::DataChange,
            CreateStrategy::LookupByName,
        );
        binding.apply("twilio").unwrap();
        assert!(matches!(
            binding.apply("").unwrap_err(),
            ApplyError::Invoke { .. }
        ));
        assert_eq!(*seen.lock().unwrap(), vec!["twilio".to_owned()]);
    }

    #[tokio::test]
    async fn test_bound_value_subscribe() {
        let slot = BoundValue::with_value(false);
        let mut rx = slot.subscribe();
        assert!(!slot.is_true());
        slot.set(true);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(true));
        assert!(slot.clone().is_true());
    }
}

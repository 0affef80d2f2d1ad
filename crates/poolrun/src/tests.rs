//! Tests for the pool, sessions and replication against a mock interpreter.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use anyhow::bail;

use crate::bootstrap::Launcher;
use crate::instance::Instance;
use crate::interpreter::Interpreter;
use crate::interpreter::LocalRef;
use crate::interpreter::Value;
use crate::pool;
use crate::pool::Pool;
use crate::registry::ARGUMENT_NAMES_MODULE;
use crate::registry::ModuleResolver;
use crate::session;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Counters observed from outside a mock instance.
#[derive(Default)]
struct Stats {
    ordinal: AtomicUsize,
    deserialized: AtomicUsize,
    released: AtomicUsize,
    dropped: AtomicBool,
}

/// Interpreter that only knows ints and strings.
///
/// `builtins.answer` is 42; any module the resolver knows evaluates to its source text.
struct MockInterpreter {
    heap: Mutex<HashMap<u64, Value>>,
    next: AtomicUsize,
    resolver: Mutex<Option<Arc<dyn ModuleResolver>>>,
    stats: Arc<Stats>,
}

impl MockInterpreter {
    fn new(stats: Arc<Stats>) -> Self {
        Self {
            heap: Mutex::new(HashMap::new()),
            next: AtomicUsize::new(1),
            resolver: Mutex::new(None),
            stats,
        }
    }

    fn alloc(&self, value: Value) -> LocalRef {
        let id = self.next.fetch_add(1, Ordering::Relaxed) as u64;
        self.heap.lock().unwrap().insert(id, value);
        LocalRef(id)
    }

    fn live(&self, obj: LocalRef) -> anyhow::Result<Value> {
        self.heap
            .lock()
            .unwrap()
            .get(&obj.0)
            .cloned()
            .ok_or_else(|| anyhow!("dangling object {}", obj))
    }
}

impl Drop for MockInterpreter {
    fn drop(&mut self) {
        self.stats.dropped.store(true, Ordering::SeqCst);
    }
}

impl Interpreter for MockInterpreter {
    fn set_find_module(&self, resolver: Arc<dyn ModuleResolver>) {
        *self.resolver.lock().unwrap() = Some(resolver);
    }

    fn set_ordinal(&self, ordinal: usize) -> anyhow::Result<()> {
        self.stats.ordinal.store(ordinal, Ordering::SeqCst);
        Ok(())
    }

    fn global(&self, module: &str, name: &str) -> anyhow::Result<LocalRef> {
        if module == "builtins" && name == "answer" {
            return Ok(self.alloc(Value::Int(42)));
        }
        let resolver = self.resolver.lock().unwrap().clone();
        match resolver.and_then(|r| r.find_module(module)) {
            Some(source) => Ok(self.alloc(Value::Str(source))),
            None => bail!("No module named '{}'", module),
        }
    }

    fn attr(&self, _obj: LocalRef, name: &str) -> anyhow::Result<LocalRef> {
        bail!("no attribute '{}'", name)
    }

    fn set_attr(&self, _obj: LocalRef, name: &str, _value: LocalRef) -> anyhow::Result<()> {
        bail!("cannot set '{}'", name)
    }

    fn call(&self, _callable: LocalRef, _args: &[LocalRef]) -> anyhow::Result<LocalRef> {
        bail!("not callable")
    }

    fn from_value(&self, value: Value) -> anyhow::Result<LocalRef> {
        Ok(self.alloc(value))
    }

    fn to_value(&self, obj: LocalRef) -> anyhow::Result<Value> {
        self.live(obj)
    }

    fn serialize(&self, obj: LocalRef) -> anyhow::Result<Vec<u8>> {
        match self.live(obj)? {
            Value::Int(n) => Ok([&[0u8][..], &n.to_le_bytes()].concat()),
            Value::Str(s) => Ok([&[1u8][..], s.as_bytes()].concat()),
            other => bail!("cannot serialize {:?}", other),
        }
    }

    fn deserialize(&self, data: &[u8]) -> anyhow::Result<LocalRef> {
        self.stats.deserialized.fetch_add(1, Ordering::SeqCst);
        let value = match data.split_first() {
            Some((0, rest)) => Value::Int(i64::from_le_bytes(rest.try_into()?)),
            Some((1, rest)) => Value::Str(String::from_utf8(rest.to_vec())?),
            _ => bail!("corrupt payload"),
        };
        Ok(self.alloc(value))
    }

    fn release(&self, obj: LocalRef) {
        if self.heap.lock().unwrap().remove(&obj.0).is_some() {
            self.stats.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Launcher handing out mock interpreters, recording the stats of each one.
fn mock_launcher() -> (Launcher, Arc<Mutex<Vec<Arc<Stats>>>>) {
    let all = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::clone(&all);
    let launcher = Launcher::in_process(move || {
        let stats = Arc::new(Stats::default());
        registry.lock().unwrap().push(Arc::clone(&stats));
        Ok(Box::new(MockInterpreter::new(stats)) as Box<dyn Interpreter>)
    });
    (launcher, all)
}

fn mock_pool(n: usize) -> (Pool, Arc<Mutex<Vec<Arc<Stats>>>>) {
    init_tracing();
    let (launcher, stats) = mock_launcher();
    let pool = Pool::builder().instances(n).launcher(launcher).build().expect("pool");
    (pool, stats)
}

// --- Construction ---

#[test]
fn test_pool_tags_ordinals_and_registers_helper() {
    let (pool, stats) = mock_pool(3);

    assert_eq!(pool.len(), 3);
    assert!(pool.modules().contains(ARGUMENT_NAMES_MODULE));
    for (i, s) in stats.lock().unwrap().iter().enumerate() {
        assert_eq!(s.ordinal.load(Ordering::SeqCst), i);
        assert_eq!(pool.instance(i).unwrap().ordinal(), i);
    }
}

#[test]
fn test_empty_pool_is_rejected() {
    let (launcher, _) = mock_launcher();
    let err = Pool::builder().instances(0).launcher(launcher).build().unwrap_err();
    assert!(matches!(err, pool::Error::Empty));
}

#[test]
fn test_failed_instance_tears_down_the_others() {
    let launched = Arc::new(Mutex::new(Vec::<Arc<Stats>>::new()));
    let seen = Arc::clone(&launched);
    let launcher = Launcher::in_process(move || {
        let mut seen = seen.lock().unwrap();
        if seen.len() == 2 {
            bail!("out of device memory");
        }
        let stats = Arc::new(Stats::default());
        seen.push(Arc::clone(&stats));
        Ok(Box::new(MockInterpreter::new(stats)) as Box<dyn Interpreter>)
    });

    let err = Pool::builder().instances(4).launcher(launcher).build().unwrap_err();

    match &err {
        pool::Error::Instance { ordinal, .. } => assert_eq!(*ordinal, 2),
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("out of device memory"));
    assert!(launched.lock().unwrap().iter().all(|s| s.dropped.load(Ordering::SeqCst)));
}

// --- Sessions ---

#[test]
fn test_sessions_release_their_lease() {
    let (pool, _) = mock_pool(2);

    let a = pool.acquire_one();
    let b = pool.acquire_one();
    assert_ne!(a.ordinal(), b.ordinal());
    assert_eq!(pool.usage(), vec![1, 1]);

    drop(a);
    drop(b);
    assert_eq!(pool.usage(), vec![0, 0]);
}

#[test]
fn test_lease_released_on_panic() {
    let (pool, _) = mock_pool(2);

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _session = pool.acquire_one();
        panic!("script blew up");
    }));

    assert!(result.is_err());
    assert_eq!(pool.usage(), vec![0, 0]);
}

#[test]
fn test_concurrent_sessions_balance_to_zero() {
    let (pool, _) = mock_pool(4);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..200 {
                    let session = pool.acquire_one();
                    let v = session.global("builtins", "answer").unwrap().to_value().unwrap();
                    assert_eq!(v, Value::Int(42));
                }
            });
        }
    });

    assert_eq!(pool.usage(), vec![0; 4]);
}

#[test]
fn test_targeted_session_holds_no_lease() {
    let (pool, _) = mock_pool(2);

    let session = pool.acquire_session_on(1).unwrap();
    assert_eq!(session.ordinal(), 1);
    assert!(session.is_pooled());
    assert!(!session.holds_lease());
    assert_eq!(pool.usage(), vec![0, 0]);

    assert!(matches!(
        pool.acquire_session_on(5),
        Err(pool::Error::NoSuchInstance { ordinal: 5, len: 2 })
    ));
}

#[test]
fn test_temporaries_released_with_session() {
    let (pool, stats) = mock_pool(1);

    {
        let session = pool.acquire_one();
        session.from_value(1i64).unwrap();
        session.from_value("two").unwrap();
    }

    assert_eq!(stats.lock().unwrap()[0].released.load(Ordering::SeqCst), 2);
}

#[test]
fn test_runtime_errors_propagate_unchanged() {
    let (pool, _) = mock_pool(1);
    let session = pool.acquire_one();

    let err = session.global("numpy", "array").unwrap_err();
    match err {
        session::Error::Runtime(e) => assert_eq!(e.to_string(), "No module named 'numpy'"),
        other => panic!("unexpected error: {}", other),
    }
}

// --- Module registry ---

#[test]
fn test_registered_module_visible_on_every_instance() {
    let (pool, _) = mock_pool(3);

    let before = pool.acquire_session_on(0).unwrap().global("helpers", "x").map(|_| ());
    assert!(before.is_err());

    pool.register_module_source("helpers", "x = 1\n");

    for ordinal in 0..pool.len() {
        let session = pool.acquire_session_on(ordinal).unwrap();
        let v = session.global("helpers", "x").unwrap().to_value().unwrap();
        assert_eq!(v, Value::Str("x = 1\n".into()));
    }
    // The earlier failure stays a failure.
    assert!(before.is_err());
}

// --- Replication ---

#[test]
fn test_standalone_session_cannot_replicate() {
    let (launcher, _) = mock_launcher();
    let instance = Instance::launch(&launcher).unwrap();
    let session = instance.acquire_session();

    assert!(!session.is_pooled());
    let obj = session.from_value(7i64).unwrap();
    assert!(matches!(session.create_movable(&obj), Err(session::Error::NotPooled)));
}

#[test]
fn test_object_ids_are_unique_across_sessions() {
    let (pool, _) = mock_pool(2);

    let a = pool.acquire_one();
    let b = pool.acquire_one();
    let x = a.create_movable(&a.from_value(1i64).unwrap()).unwrap();
    let y = b.create_movable(&b.from_value(2i64).unwrap()).unwrap();
    let z = a.create_movable(&a.from_value(3i64).unwrap()).unwrap();

    assert_ne!(x.id(), y.id());
    assert!(x.id() < z.id());
}

#[test]
fn test_foreign_object_is_rejected() {
    let (pool, _) = mock_pool(2);

    let s0 = pool.acquire_session_on(0).unwrap();
    let s1 = pool.acquire_session_on(1).unwrap();
    let obj = s0.from_value(5i64).unwrap();

    assert!(matches!(
        s1.create_movable(&obj),
        Err(session::Error::ForeignObject { session: 1, object: 0 })
    ));
}

#[test]
fn test_materialize_is_cached_per_instance() {
    let (pool, stats) = mock_pool(2);

    let handle = {
        let session = pool.acquire_session_on(0).unwrap();
        session.create_movable(&session.from_value("weights").unwrap()).unwrap()
    };

    let s1 = pool.acquire_session_on(1).unwrap();
    let first = s1.from_movable(&handle).unwrap();
    let second = s1.from_movable(&handle).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.local_ref(), second.local_ref());

    let other = pool.acquire_session_on(1).unwrap();
    assert_eq!(other.from_movable(&handle).unwrap().local_ref(), first.local_ref());

    assert_eq!(stats.lock().unwrap()[1].deserialized.load(Ordering::SeqCst), 1);
    assert_eq!(first.to_value().unwrap(), Value::Str("weights".into()));
}

#[test]
fn test_last_handle_drop_unloads_everywhere() {
    let (pool, _) = mock_pool(3);

    let handle = {
        let session = pool.acquire_one();
        session.create_movable(&session.from_value(99i64).unwrap()).unwrap()
    };
    let id = handle.id();

    for ordinal in 0..3 {
        let session = pool.acquire_session_on(ordinal).unwrap();
        handle.materialize(&session).unwrap();
    }
    assert!(pool.instances().all(|i| i.is_cached(id)));

    let copy = handle.clone();
    drop(handle);
    assert!(pool.instances().all(|i| i.is_cached(id)));

    drop(copy);
    assert!(pool.instances().all(|i| !i.is_cached(id) && i.cached_len() == 0));
}

#[test]
fn test_unload_one_instance_keeps_bytes() {
    let (pool, stats) = mock_pool(2);

    let handle = {
        let session = pool.acquire_one();
        session.create_movable(&session.from_value(3i64).unwrap()).unwrap()
    };
    for ordinal in 0..2 {
        let session = pool.acquire_session_on(ordinal).unwrap();
        session.from_movable(&handle).unwrap();
    }

    handle.unload(Some(0)).unwrap();
    assert!(!pool.instance(0).unwrap().is_cached(handle.id()));
    assert!(pool.instance(1).unwrap().is_cached(handle.id()));

    // Materializing again deserializes the retained bytes.
    let session = pool.acquire_session_on(0).unwrap();
    assert_eq!(session.from_movable(&handle).unwrap().to_value().unwrap(), Value::Int(3));
    assert_eq!(stats.lock().unwrap()[0].deserialized.load(Ordering::SeqCst), 2);

    handle.unload(None).unwrap();
    assert!(pool.instances().all(|i| i.cached_len() == 0));
    assert!(matches!(handle.unload(Some(9)), Err(pool::Error::NoSuchInstance { .. })));
}

#[test]
fn test_handle_from_another_pool_is_rejected() {
    let (pool_a, _) = mock_pool(1);
    let (pool_b, _) = mock_pool(1);

    let in_a = {
        let session = pool_a.acquire_one();
        session.create_movable(&session.from_value(111i64).unwrap()).unwrap()
    };
    let in_b = {
        let session = pool_b.acquire_one();
        session.create_movable(&session.from_value(222i64).unwrap()).unwrap()
    };
    // Both pools number their objects from the same starting id.
    assert_eq!(in_a.id(), in_b.id());

    let session = pool_b.acquire_one();
    session.from_movable(&in_b).unwrap();
    assert!(matches!(session.from_movable(&in_a), Err(session::Error::ForeignPool)));
    assert!(matches!(in_a.materialize(&session), Err(session::Error::ForeignPool)));
    assert_eq!(session.instance().cached_len(), 1);
    assert_eq!(session.from_movable(&in_b).unwrap().to_value().unwrap(), Value::Int(222));
}

#[test]
fn test_standalone_session_cannot_materialize() {
    let (pool, _) = mock_pool(1);
    let (launcher, _) = mock_launcher();
    let instance = Instance::launch(&launcher).unwrap();

    let handle = {
        let session = pool.acquire_one();
        session.create_movable(&session.from_value(5i64).unwrap()).unwrap()
    };

    {
        let session = instance.acquire_session();
        assert!(matches!(session.from_movable(&handle), Err(session::Error::NotPooled)));
    }
    drop(handle);
    assert_eq!(instance.cached_len(), 0);
}

#[test]
fn test_acquire_session_for_object() {
    let (pool, _) = mock_pool(2);

    let handle = {
        let session = pool.acquire_one();
        session.create_movable(&session.from_value("model").unwrap()).unwrap()
    };

    let session = handle.acquire_session(Some(1)).unwrap();
    assert_eq!(session.ordinal(), 1);
    let model = session.self_obj().expect("self object");
    assert_eq!(model.to_value().unwrap(), Value::Str("model".into()));

    let balanced = handle.acquire_session(None).unwrap();
    assert!(balanced.holds_lease());
}

#[test]
fn test_serialization_failure_is_a_runtime_error() {
    let (pool, _) = mock_pool(1);
    let session = pool.acquire_one();
    let obj = session.from_value(Value::List(vec![])).unwrap();

    assert!(matches!(session.create_movable(&obj), Err(session::Error::Runtime(_))));
}

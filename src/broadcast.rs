//! State change fan-out to observers
//!
//! Observers are held weakly: dropping the last `Arc` to a listener is
//! enough to unsubscribe it. `notify` never calls a listener itself; it marks
//! categories as pending and wakes the delivery task, so the decode path never
//! waits on observer code. Pending categories coalesce: a burst of GPS
//! updates may reach a listener as a single `Gps` notification.

use parking_lot::Mutex;
use std::fmt;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

// =============================================================================
// Categories
// =============================================================================

/// What changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Category {
    Status,
    FlightMode,
    SensorStatus,
    Imu,
    Attitude,
    Altitude,
    Sonar,
    Battery,
    Rssi,
    Gps,
    Navigation,
    Receiver,
    Motors,
    Settings,
    Identity,
    Storage,
    /// Link opened or closed
    Communication,
    /// Any message was dispatched
    DataReceived,
}

impl Category {
    pub const ALL: [Category; 18] = [
        Category::Status,
        Category::FlightMode,
        Category::SensorStatus,
        Category::Imu,
        Category::Attitude,
        Category::Altitude,
        Category::Sonar,
        Category::Battery,
        Category::Rssi,
        Category::Gps,
        Category::Navigation,
        Category::Receiver,
        Category::Motors,
        Category::Settings,
        Category::Identity,
        Category::Storage,
        Category::Communication,
        Category::DataReceived,
    ];

    #[inline]
    fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

/// Set of categories, one bit each
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CategorySet(u32);

impl CategorySet {
    pub const EMPTY: CategorySet = CategorySet(0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, category: Category) -> bool {
        self.0 & category.bit() != 0
    }

    pub fn insert(&mut self, category: Category) {
        self.0 |= category.bit();
    }

    pub fn iter(self) -> impl Iterator<Item = Category> {
        Category::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    fn bits(self) -> u32 {
        self.0
    }
}

impl From<Category> for CategorySet {
    fn from(category: Category) -> Self {
        Self(category.bit())
    }
}

impl BitOr for CategorySet {
    type Output = CategorySet;

    fn bitor(self, rhs: CategorySet) -> CategorySet {
        CategorySet(self.0 | rhs.0)
    }
}

impl BitOr<Category> for CategorySet {
    type Output = CategorySet;

    fn bitor(self, rhs: Category) -> CategorySet {
        CategorySet(self.0 | rhs.bit())
    }
}

impl BitOr for Category {
    type Output = CategorySet;

    fn bitor(self, rhs: Category) -> CategorySet {
        CategorySet(self.bit() | rhs.bit())
    }
}

impl fmt::Debug for CategorySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// Broadcaster
// =============================================================================

/// State change observer
pub trait Listener: Send + Sync {
    fn on_change(&self, category: Category);
}

impl<F> Listener for F
where
    F: Fn(Category) + Send + Sync,
{
    fn on_change(&self, category: Category) {
        self(category)
    }
}

/// A listener that can be held as `Weak<dyn Listener>`
///
/// Covers every concrete listener type and `dyn Listener` itself, so both
/// `Arc<MyListener>` and `Arc<dyn Listener>` register.
pub trait WeakListener: Listener {
    fn downgrade(this: &Arc<Self>) -> Weak<dyn Listener>;
}

impl<L: Listener + 'static> WeakListener for L {
    fn downgrade(this: &Arc<Self>) -> Weak<dyn Listener> {
        Arc::downgrade(this) as Weak<dyn Listener>
    }
}

impl WeakListener for dyn Listener {
    fn downgrade(this: &Arc<Self>) -> Weak<dyn Listener> {
        Arc::downgrade(this)
    }
}

/// Registry of weakly held listeners
#[derive(Default)]
pub struct Broadcaster {
    listeners: Mutex<Vec<Weak<dyn Listener>>>,
    pending: AtomicU32,
    wake: Notify,
    closed: AtomicBool,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe; the registry keeps only a weak reference
    pub fn register<L: WeakListener + ?Sized>(&self, listener: &Arc<L>) {
        let weak = L::downgrade(listener);
        self.listeners.lock().push(weak);
    }

    /// Unsubscribe; unknown listeners are ignored
    pub fn unregister<L: Listener + ?Sized>(&self, listener: &Arc<L>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .lock()
            .retain(|w| w.as_ptr() as *const () != target);
    }

    /// Live listener count (dead weak entries excluded)
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Mark categories as changed and wake the delivery task
    pub fn notify(&self, categories: CategorySet) {
        if categories.is_empty() {
            return;
        }
        self.pending.fetch_or(categories.bits(), Ordering::AcqRel);
        self.wake.notify_one();
    }

    /// Deliver everything pending on the calling thread
    ///
    /// Returns the categories that were delivered.
    pub fn deliver_pending(&self) -> CategorySet {
        let categories = CategorySet::from_bits(self.pending.swap(0, Ordering::AcqRel));
        if categories.is_empty() {
            return categories;
        }

        // Point-in-time copy; callbacks run without the lock so they may
        // register or unregister freely
        let snapshot: Vec<Arc<dyn Listener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|w| w.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        // A panicking listener loses that one call; the others and the
        // delivery task keep going
        for category in categories.iter() {
            for listener in &snapshot {
                let call = panic::catch_unwind(AssertUnwindSafe(|| listener.on_change(category)));
                if call.is_err() {
                    warn!("Listener panicked handling {:?}", category);
                }
            }
        }
        categories
    }

    /// Spawn the task that delivers notifications until [`close`](Self::close)
    pub fn spawn_delivery(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.wake.notified().await;
                if this.closed.load(Ordering::Acquire) {
                    break;
                }
                this.deliver_pending();
            }
        })
    }

    /// Stop the delivery task
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("listeners", &self.listener_count())
            .field(
                "pending",
                &CategorySet::from_bits(self.pending.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counter {
        calls: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Listener for Counter {
        fn on_change(&self, _category: Category) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl Listener for Panicky {
        fn on_change(&self, _category: Category) {
            panic!("listener failure");
        }
    }

    /// Unregisters itself on first notification
    struct OneShot {
        broadcaster: Arc<Broadcaster>,
        me: Mutex<Option<Arc<OneShot>>>,
        calls: AtomicUsize,
    }

    impl Listener for OneShot {
        fn on_change(&self, _category: Category) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = self.me.lock().take() {
                self.broadcaster.unregister(&me);
            }
        }
    }

    #[test]
    fn test_category_set() {
        let set = Category::Gps | Category::Battery;
        assert!(set.contains(Category::Gps));
        assert!(set.contains(Category::Battery));
        assert!(!set.contains(Category::Attitude));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Category::Battery, Category::Gps]);
        assert!(CategorySet::EMPTY.is_empty());
    }

    #[test]
    fn test_fan_out_with_self_unregistration() {
        let broadcaster = Arc::new(Broadcaster::new());
        let a = Counter::new();
        let c = Counter::new();
        let b = Arc::new(OneShot {
            broadcaster: broadcaster.clone(),
            me: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        *b.me.lock() = Some(b.clone());

        broadcaster.register(&a);
        broadcaster.register(&b);
        broadcaster.register(&c);

        broadcaster.notify(Category::Gps.into());
        broadcaster.deliver_pending();

        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.calls(), 1);
        assert_eq!(broadcaster.listener_count(), 2);

        broadcaster.notify(Category::Gps.into());
        broadcaster.deliver_pending();
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.calls(), 2);
    }

    #[test]
    fn test_dropped_listener_is_skipped() {
        let broadcaster = Broadcaster::new();
        let kept = Counter::new();
        let dropped = Counter::new();
        broadcaster.register(&kept);
        broadcaster.register(&dropped);
        drop(dropped);

        assert_eq!(broadcaster.listener_count(), 1);
        broadcaster.notify(Category::Attitude.into());
        broadcaster.deliver_pending();
        assert_eq!(kept.calls(), 1);
    }

    #[test]
    fn test_notifications_coalesce() {
        let broadcaster = Broadcaster::new();
        let listener = Counter::new();
        broadcaster.register(&listener);

        for _ in 0..50 {
            broadcaster.notify(Category::Gps.into());
        }
        broadcaster.notify(Category::Battery | Category::Rssi);
        let delivered = broadcaster.deliver_pending();

        assert_eq!(delivered, Category::Gps | Category::Battery | Category::Rssi);
        assert_eq!(listener.calls(), 3);
        assert!(broadcaster.deliver_pending().is_empty());
    }

    #[test]
    fn test_closure_listener() {
        let broadcaster = Broadcaster::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = Arc::new(move |c: Category| sink.lock().push(c));
        broadcaster.register(&listener);

        broadcaster.notify(Category::Motors.into());
        broadcaster.deliver_pending();
        assert_eq!(*seen.lock(), vec![Category::Motors]);
    }

    #[test]
    fn test_trait_object_listener() {
        let broadcaster = Broadcaster::new();
        let counter = Counter::new();
        let listener: Arc<dyn Listener> = counter.clone();
        broadcaster.register(&listener);
        assert_eq!(broadcaster.listener_count(), 1);

        broadcaster.notify(Category::Gps.into());
        broadcaster.deliver_pending();
        assert_eq!(counter.calls(), 1);

        broadcaster.unregister(&listener);
        assert_eq!(broadcaster.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_isolated() {
        let broadcaster = Broadcaster::new();
        let panicky = Arc::new(|c: Category| {
            if c == Category::Gps {
                panic!("listener failure");
            }
        });
        let counter = Counter::new();
        broadcaster.register(&panicky);
        broadcaster.register(&counter);

        broadcaster.notify(Category::Gps | Category::Battery);
        let delivered = broadcaster.deliver_pending();
        assert_eq!(delivered, Category::Gps | Category::Battery);
        assert_eq!(counter.calls(), 2);
        assert_eq!(broadcaster.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_delivery_task_survives_panicking_listener() {
        let broadcaster = Arc::new(Broadcaster::new());
        let panicky = Arc::new(Panicky);
        let counter = Counter::new();
        broadcaster.register(&panicky);
        broadcaster.register(&counter);
        let task = broadcaster.spawn_delivery();

        for expected in 1..=2 {
            broadcaster.notify(Category::Status.into());
            for _ in 0..100 {
                if counter.calls() == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(counter.calls(), expected);
        }
        assert!(!task.is_finished());

        broadcaster.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_delivery_task() {
        let broadcaster = Arc::new(Broadcaster::new());
        let listener = Counter::new();
        broadcaster.register(&listener);
        let task = broadcaster.spawn_delivery();

        broadcaster.notify(Category::Status.into());
        for _ in 0..100 {
            if listener.calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(listener.calls(), 1);

        broadcaster.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}

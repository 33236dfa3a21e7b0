//! Debounced filter store
//!
//! Setters mutate the draft synchronously, reset the page to 0 and re-arm a
//! timer owned by this store. When the timer fires the whole draft is copied
//! into the committed snapshot in one `watch` send. Pagination setters skip
//! the debounce.
//!
//! Setters spawn the debounce timer on the current tokio runtime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::criteria::{CommittedFilters, CustomValue, DateRange, DraftFilters, FilterField};
use super::persist::{FilterPersistence, Pagination, PersistedFilterState};

struct StoreState {
    draft: DraftFilters,
    pagination: Pagination,
    /// Number of committed transitions
    revision: u64,
    pending: bool,
}

struct Shared {
    debounce: Duration,
    state: Mutex<StoreState>,
    committed_tx: watch::Sender<CommittedFilters>,
    persistence: Option<Arc<dyn FilterPersistence>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy the draft into committed; returns whether committed changed
    fn commit(&self) -> bool {
        let mut state = self.lock();
        state.pending = false;

        let next = CommittedFilters::from_draft(&state.draft);
        let changed = self.committed_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if changed {
            state.revision += 1;
            state.pagination.page = 0;
            debug!(revision = state.revision, "Filters committed");
        }
        self.persist(&state);
        changed
    }

    fn persist(&self, state: &StoreState) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let snapshot = PersistedFilterState {
            draft: state.draft.criteria().clone(),
            committed: self.committed_tx.borrow().criteria().clone(),
            pagination: state.pagination,
        };
        if let Err(e) = persistence.save(&snapshot) {
            warn!(error = %e, "Failed to persist filter state");
        }
    }
}

pub struct FilterStore {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl FilterStore {
    /// Empty store without durable state
    pub fn new(debounce: Duration) -> Self {
        Self::build(debounce, DraftFilters::default(), Pagination::default(), None)
    }

    /// Restore from durable state, falling back to defaults on any error.
    ///
    /// Both draft and committed start from the persisted draft.
    pub fn restore(debounce: Duration, persistence: Arc<dyn FilterPersistence>) -> Self {
        let (draft, pagination) = match persistence.load() {
            Ok(Some(saved)) => (DraftFilters::from_criteria(saved.draft), saved.pagination),
            Ok(None) => (DraftFilters::default(), Pagination::default()),
            Err(e) => {
                warn!(error = %e, "Failed to load filter state, using defaults");
                (DraftFilters::default(), Pagination::default())
            }
        };
        Self::build(debounce, draft, pagination, Some(persistence))
    }

    fn build(
        debounce: Duration,
        draft: DraftFilters,
        pagination: Pagination,
        persistence: Option<Arc<dyn FilterPersistence>>,
    ) -> Self {
        let (committed_tx, _) = watch::channel(CommittedFilters::from_draft(&draft));
        Self {
            shared: Arc::new(Shared {
                debounce,
                state: Mutex::new(StoreState {
                    draft,
                    pagination,
                    revision: 0,
                    pending: false,
                }),
                committed_tx,
                persistence,
            }),
            timer: Mutex::new(None),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn draft(&self) -> DraftFilters {
        self.shared.lock().draft.clone()
    }

    pub fn committed(&self) -> CommittedFilters {
        self.shared.committed_tx.borrow().clone()
    }

    pub fn subscribe_committed(&self) -> watch::Receiver<CommittedFilters> {
        self.shared.committed_tx.subscribe()
    }

    pub fn pagination(&self) -> Pagination {
        self.shared.lock().pagination
    }

    pub fn revision(&self) -> u64 {
        self.shared.lock().revision
    }

    /// Whether a debounced commit is armed
    pub fn has_pending_commit(&self) -> bool {
        self.shared.lock().pending
    }

    // =========================================================================
    // Debounced setters
    // =========================================================================

    pub fn set_field_values<I, S>(&self, field: FilterField, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_draft(|draft| draft.set_field_values(field, values));
    }

    /// Returns whether `value` is selected afterwards
    pub fn toggle_field_value(&self, field: FilterField, value: &str) -> bool {
        let mut selected = false;
        self.update_draft(|draft| selected = draft.toggle_value(field, value));
        selected
    }

    pub fn clear_field(&self, field: FilterField) {
        self.update_draft(|draft| draft.clear_field(field));
    }

    pub fn set_search_query(&self, query: impl Into<String>) {
        self.update_draft(|draft| draft.set_search_query(query));
    }

    pub fn set_date_range(&self, range: DateRange) {
        self.update_draft(|draft| draft.set_date_range(range));
    }

    pub fn set_custom_filter(&self, key: impl Into<String>, value: CustomValue) {
        self.update_draft(|draft| draft.set_custom_filter(key, value));
    }

    pub fn remove_custom_filter(&self, key: &str) {
        self.update_draft(|draft| draft.remove_custom_filter(key));
    }

    fn update_draft<F: FnOnce(&mut DraftFilters)>(&self, f: F) {
        {
            let mut state = self.shared.lock();
            f(&mut state.draft);
            state.pagination.page = 0;
            state.pending = true;
            self.shared.persist(&state);
        }
        self.arm_timer();
    }

    fn arm_timer(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let shared = Arc::clone(&self.shared);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(shared.debounce).await;
            shared.commit();
        }));
    }

    fn cancel_timer(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }

    // =========================================================================
    // Immediate transitions
    // =========================================================================

    /// Reset every filter and commit without waiting for the debounce
    pub fn clear_all_filters(&self) {
        self.cancel_timer();
        {
            let mut state = self.shared.lock();
            state.draft.clear();
            state.pagination.page = 0;
        }
        self.shared.commit();
    }

    /// Commit an armed draft now; returns whether committed changed
    pub fn flush(&self) -> bool {
        if !self.has_pending_commit() {
            return false;
        }
        self.cancel_timer();
        self.shared.commit()
    }

    pub fn set_page(&self, page: u32) {
        let mut state = self.shared.lock();
        state.pagination.page = page;
        self.shared.persist(&state);
    }

    pub fn set_page_size(&self, page_size: u32) {
        let mut state = self.shared.lock();
        state.pagination.page_size = page_size.max(1);
        state.pagination.page = 0;
        self.shared.persist(&state);
    }
}

impl Drop for FilterStore {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LeadError;
    use crate::filters::{FilterCriteria, JsonFilePersistence};
    use tokio::time::sleep;

    const DEBOUNCE: Duration = Duration::from_millis(800);

    #[tokio::test(start_paused = true)]
    async fn test_rapid_setters_commit_once_to_last_value() {
        let store = FilterStore::new(DEBOUNCE);
        let mut rx = store.subscribe_committed();

        for query in ["a", "ad", "ada", "ada l", "ada lo"] {
            store.set_search_query(query);
            sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(store.draft().criteria().search_query, "ada lo");
        assert!(!rx.has_changed().unwrap());

        sleep(Duration::from_millis(699)).await;
        assert!(!rx.has_changed().unwrap());

        sleep(Duration::from_millis(2)).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().search_query, "ada lo");
        assert_eq!(store.revision(), 1);

        sleep(Duration::from_secs(5)).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_is_one_snapshot() {
        let store = FilterStore::new(DEBOUNCE);
        store.set_field_values(FilterField::School, ["North High"]);
        store.set_field_values(FilterField::District, ["Springfield"]);
        store.set_custom_filter("year", CustomValue::Integer(2024));

        sleep(DEBOUNCE + Duration::from_millis(1)).await;
        let committed = store.committed();
        assert_eq!(committed.criteria(), store.draft().criteria());
        assert_eq!(committed.values(FilterField::School).count(), 1);
        assert_eq!(committed.custom_filters.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_bypasses_debounce() {
        let store = FilterStore::new(DEBOUNCE);
        store.set_field_values(FilterField::Gender, ["female"]);
        assert!(store.flush());
        assert!(store.committed().has_active_filters());

        store.set_search_query("pending");
        store.clear_all_filters();
        assert!(!store.committed().has_active_filters());
        let revision = store.revision();

        sleep(Duration::from_secs(2)).await;
        assert_eq!(store.revision(), revision);
        assert!(!store.committed().has_active_filters());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_reset_page_but_pagination_is_immediate() {
        let store = FilterStore::new(DEBOUNCE);
        store.set_page(3);
        assert_eq!(store.pagination().page, 3);

        store.toggle_field_value(FilterField::Stream, "science");
        assert_eq!(store.pagination().page, 0);

        store.set_page(2);
        store.set_page_size(50);
        assert_eq!(store.pagination(), Pagination { page: 0, page_size: 50 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stores_do_not_share_timers() {
        let a = FilterStore::new(DEBOUNCE);
        let b = FilterStore::new(DEBOUNCE);
        a.set_search_query("alpha");
        b.set_search_query("beta");
        drop(b);

        sleep(DEBOUNCE * 2).await;
        assert_eq!(a.committed().search_query, "alpha");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_aligns_committed_with_draft() {
        let dir = tempfile::tempdir().unwrap();
        let persistence: Arc<dyn FilterPersistence> = Arc::new(JsonFilePersistence::new(dir.path()));

        {
            let store = FilterStore::restore(DEBOUNCE, Arc::clone(&persistence));
            store.set_field_values(FilterField::District, ["Springfield"]);
            store.set_page_size(25);
            // Dropped before the debounce fires
        }

        let restored = FilterStore::restore(DEBOUNCE, persistence);
        assert_eq!(restored.committed().criteria(), restored.draft().criteria());
        assert_eq!(restored.committed().values(FilterField::District).count(), 1);
        assert_eq!(restored.pagination().page_size, 25);
    }

    struct BrokenPersistence;

    impl FilterPersistence for BrokenPersistence {
        fn load(&self) -> Result<Option<PersistedFilterState>, LeadError> {
            Err(LeadError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")))
        }

        fn save(&self, _state: &PersistedFilterState) -> Result<(), LeadError> {
            Err(LeadError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failures_fail_open() {
        let store = FilterStore::restore(DEBOUNCE, Arc::new(BrokenPersistence));
        assert_eq!(*store.committed().criteria(), FilterCriteria::default());

        store.set_search_query("still works");
        assert!(store.flush());
        assert_eq!(store.committed().search_query, "still works");
    }
}

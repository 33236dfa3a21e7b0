//! Filter model: criteria value objects, the debounced store and its
//! persistence, and option ranking for presentation.

pub mod criteria;
pub mod options;
pub mod persist;
pub mod store;

pub use criteria::{CommittedFilters, CustomValue, DateRange, DraftFilters, FilterCriteria, FilterField};
pub use options::{rank_options, RankedOption};
pub use persist::{FilterPersistence, JsonFilePersistence, PersistedFilterState, Pagination};
pub use store::FilterStore;

//! Leadline command line
//!
//! Operates on the lead database under the configured storage directory.
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and a default config
//! leadline init
//!
//! # Manage callers and bucket templates
//! leadline user-add admin-1 admin@example.com "Ada Admin" --role admin
//! leadline bucket-add "Spring fair" --field city --field grade
//!
//! # Import structured rows and watch the job
//! leadline --as-user admin-1 import leads.json --bucket <bucket-id>
//!
//! # Save filters, then read with them
//! leadline filter --district Springfield --search ada
//! leadline --as-user admin-1 counts
//! leadline --as-user admin-1 list --page 1
//! leadline filter --page 2 --page-size 50
//!
//! # Bulk operations
//! leadline --as-user admin-1 assign --target rep-1 --target rep-2 --equal --count 200
//! leadline --as-user admin-1 delete --id lead-1 --id lead-2
//! leadline job <job-id> --watch
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use leadline::db::{buckets, users};
use leadline::filters::{
    rank_options, CustomValue, DateRange, FilterPersistence, JsonFilePersistence, RankedOption,
};
use leadline::services::{
    spawn_logging_listener, AssignTarget, BulkAssignRequest, BulkDeleteRequest, DistributionMode, PageSpec,
    Selection,
};
use leadline::{
    CommittedFilters, Config, DraftFilters, FilterField, FilterStore, ImportRequest, JobStore, LeadDb, NewLeadInput,
    RetryPolicy, Services, SqliteLeadStore, UserRole, UserTableAuthProvider,
};

#[derive(Parser, Debug)]
#[command(name = "leadline")]
#[command(about = "Lead filtering, counting and bulk mutation")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "LEADLINE_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Act as this user (role is looked up in the users table)
    #[arg(long, env = "LEADLINE_USER")]
    as_user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Default, Clone)]
struct FilterArgs {
    #[arg(long)]
    school: Vec<String>,

    #[arg(long)]
    district: Vec<String>,

    #[arg(long)]
    gender: Vec<String>,

    #[arg(long)]
    stream: Vec<String>,

    /// Bucket id
    #[arg(long)]
    bucket: Vec<String>,

    /// Case-insensitive substring of name, phone or email
    #[arg(long)]
    search: Option<String>,

    /// Earliest creation time (RFC 3339)
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Latest creation time (RFC 3339)
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Custom field equality, `key=value`
    #[arg(long, value_name = "KEY=VALUE")]
    custom: Vec<String>,
}

impl FilterArgs {
    fn is_empty(&self) -> bool {
        self.field_values().iter().all(|(_, v)| v.is_empty())
            && self.search.is_none()
            && self.from.is_none()
            && self.to.is_none()
            && self.custom.is_empty()
    }

    fn field_values(&self) -> [(FilterField, &Vec<String>); 5] {
        [
            (FilterField::School, &self.school),
            (FilterField::District, &self.district),
            (FilterField::Gender, &self.gender),
            (FilterField::Stream, &self.stream),
            (FilterField::Bucket, &self.bucket),
        ]
    }

    fn custom_filters(&self) -> anyhow::Result<Vec<(String, CustomValue)>> {
        self.custom
            .iter()
            .map(|pair| {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("custom filter must be key=value: {}", pair))?;
                Ok((key.trim().to_string(), CustomValue::parse(value.trim())))
            })
            .collect()
    }

    fn date_range(&self) -> Option<DateRange> {
        (self.from.is_some() || self.to.is_some()).then(|| DateRange {
            from: self.from,
            to: self.to,
        })
    }

    fn to_draft(&self) -> anyhow::Result<DraftFilters> {
        let mut draft = DraftFilters::default();
        for (field, values) in self.field_values() {
            draft.set_field_values(field, values.iter().cloned());
        }
        if let Some(search) = &self.search {
            draft.set_search_query(search.clone());
        }
        if let Some(range) = self.date_range() {
            draft.set_date_range(range);
        }
        for (key, value) in self.custom_filters()? {
            draft.set_custom_filter(key, value);
        }
        Ok(draft)
    }

    /// Apply flags to a live store; only fields named on the command line change
    fn apply_to(&self, store: &FilterStore) -> anyhow::Result<()> {
        for (field, values) in self.field_values() {
            if !values.is_empty() {
                store.set_field_values(field, values.iter().cloned());
            }
        }
        if let Some(search) = &self.search {
            store.set_search_query(search.clone());
        }
        if let Some(range) = self.date_range() {
            store.set_date_range(range);
        }
        for (key, value) in self.custom_filters()? {
            store.set_custom_filter(key, value);
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and write a default config
    Init,

    /// Add a user
    UserAdd {
        id: String,
        email: String,
        full_name: String,
        #[arg(long, default_value = "sales_rep")]
        role: String,
    },

    /// List users
    Users,

    /// Add a bucket template
    BucketAdd {
        name: String,
        /// Custom field key (repeatable)
        #[arg(long = "field")]
        fields: Vec<String>,
    },

    /// List bucket templates
    Buckets,

    /// Import leads from a JSON array of rows
    Import {
        file: PathBuf,
        #[arg(long)]
        bucket: Option<String>,
        /// Return once queued instead of waiting for completion
        #[arg(long)]
        no_wait: bool,
    },

    /// Update the saved filters used by commands given no filter flags
    Filter {
        #[command(flatten)]
        filters: FilterArgs,
        /// Reset every saved filter
        #[arg(long)]
        clear: bool,
        /// Saved 0-based page number used by `list`
        #[arg(long)]
        page: Option<u32>,
        /// Saved page size used by `list`; resets the page
        #[arg(long)]
        page_size: Option<u32>,
    },

    /// Filtered and total counts with per-field badges
    Counts {
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Selectable values per field, ranked by count
    Unique {
        #[command(flatten)]
        filters: FilterArgs,
        /// Hide options with fewer matches (selected options always show)
        #[arg(long, default_value_t = 0)]
        min_count: i64,
    },

    /// List matching leads
    List {
        #[command(flatten)]
        filters: FilterArgs,
        /// 0-based page number (defaults to the saved page)
        #[arg(long)]
        page: Option<u32>,
        /// Defaults to the saved page size
        #[arg(long)]
        page_size: Option<u32>,
        /// Walk every page with a cursor instead of one numbered page
        #[arg(long)]
        all: bool,
    },

    /// Assign leads to users
    Assign {
        #[command(flatten)]
        filters: FilterArgs,
        /// `user` or `user=count` (repeatable)
        #[arg(long = "target", value_name = "USER[=COUNT]", required = true)]
        targets: Vec<String>,
        /// Split evenly instead of per-target counts
        #[arg(long)]
        equal: bool,
        /// Explicit lead ids instead of a filter selection
        #[arg(long = "id")]
        ids: Vec<String>,
        /// Number of matching leads to select
        #[arg(long)]
        count: Option<u32>,
    },

    /// Delete leads
    Delete {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long = "id")]
        ids: Vec<String>,
        #[arg(long)]
        count: Option<u32>,
    },

    /// Show a job, optionally following it to completion
    Job {
        id: String,
        #[arg(long)]
        watch: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn progress_line(state: &leadline::BulkJobState) {
    println!(
        "[{}] {} {}/{} ({})",
        state.job_id,
        state.status,
        state.processed,
        state.total,
        state.summary()
    );
    if state.is_terminal() {
        for line in state.error_lines() {
            println!("  {}", line);
        }
    }
}

fn parse_target(raw: &str, equal: bool) -> anyhow::Result<AssignTarget> {
    match raw.split_once('=') {
        Some((user_id, count)) => Ok(AssignTarget {
            user_id: user_id.to_string(),
            count: count.parse().with_context(|| format!("invalid count in {}", raw))?,
        }),
        None if equal => Ok(AssignTarget {
            user_id: raw.to_string(),
            count: 0,
        }),
        None => bail!("target {} needs a count (user=count) unless --equal is set", raw),
    }
}

struct App {
    config: Config,
    db: LeadDb,
    store: Arc<SqliteLeadStore>,
    services: Services,
}

impl App {
    fn open(config: Config, as_user: Option<String>) -> anyhow::Result<Self> {
        let db = LeadDb::open(&config.database_path(), config.pool_size)?;
        let store = SqliteLeadStore::shared(db.clone(), RetryPolicy::from_config(&config));
        let auth = Arc::new(UserTableAuthProvider::new(db.clone(), as_user));
        let services = Services::new(store.clone(), auth, &config);
        spawn_logging_listener(services.events.clone());
        Ok(Self {
            config,
            db,
            store,
            services,
        })
    }

    fn filter_store(&self) -> FilterStore {
        let persistence: Arc<dyn FilterPersistence> = Arc::new(JsonFilePersistence::new(&self.config.storage_dir));
        FilterStore::restore(self.config.debounce(), persistence)
    }

    /// Flags when given, otherwise the saved committed filters
    fn criteria(&self, filters: &FilterArgs) -> anyhow::Result<CommittedFilters> {
        if filters.is_empty() {
            Ok(self.filter_store().committed())
        } else {
            Ok(CommittedFilters::snapshot(filters.to_draft()?.criteria().clone()))
        }
    }

    fn selection(&self, filters: &FilterArgs, ids: Vec<String>, count: Option<u32>) -> anyhow::Result<Selection> {
        if !ids.is_empty() {
            return Ok(Selection::Ids(ids));
        }
        Ok(Selection::Filter {
            criteria: self.criteria(filters)?,
            count: count.unwrap_or(self.config.bulk_id_ceiling),
        })
    }

    async fn watch_job(&self, job_id: &str) {
        let subscription = self
            .services
            .progress
            .subscribe(job_id, |state| progress_line(&state));
        subscription.finished().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("leadline=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;
    let app = App::open(config, args.as_user)?;

    match args.command {
        Command::Init => {
            let config_path = app.config.config_path();
            if !config_path.exists() {
                app.config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            info!(path = %app.config.database_path().display(), "Database ready");
        }

        Command::UserAdd {
            id,
            email,
            full_name,
            role,
        } => {
            let role: UserRole = role.parse()?;
            let user = app
                .db
                .run(move |conn| users::create_user(conn, &id, &email, &full_name, role))
                .await?;
            print_json(&user)?;
        }

        Command::Users => {
            let all = app.db.run(users::list_users).await?;
            print_json(&all)?;
        }

        Command::BucketAdd { name, fields } => {
            let bucket = app
                .db
                .run(move |conn| buckets::create_bucket(conn, &name, &fields))
                .await?;
            print_json(&bucket)?;
        }

        Command::Buckets => {
            let all = app.db.run(buckets::list_buckets).await?;
            print_json(&all)?;
        }

        Command::Import { file, bucket, no_wait } => {
            if let Some(bucket_id) = bucket.clone() {
                let lookup = bucket_id.clone();
                if app.db.run(move |conn| buckets::get_bucket(conn, &lookup)).await?.is_none() {
                    bail!("unknown bucket {}", bucket_id);
                }
            }
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let rows: Vec<NewLeadInput> = serde_json::from_str(&content)?;

            let job_id = app
                .services
                .imports
                .start_import(ImportRequest { bucket_id: bucket, rows })
                .await?;
            println!("{}", job_id);
            if !no_wait {
                app.watch_job(&job_id).await;
            }
        }

        Command::Filter {
            filters,
            clear,
            page,
            page_size,
        } => {
            let store = app.filter_store();
            if clear {
                store.clear_all_filters();
            } else {
                filters.apply_to(&store)?;
                store.flush();
            }
            if let Some(page_size) = page_size {
                store.set_page_size(page_size);
            }
            if let Some(page) = page {
                store.set_page(page);
            }
            let pagination = store.pagination();
            info!(page = pagination.page, page_size = pagination.page_size, "Saved pagination");
            print_json(store.committed().criteria())?;
        }

        Command::Counts { filters } => {
            let criteria = app.criteria(&filters)?;
            let counts = app.services.counts.get_counts(&criteria).await?;
            print_json(&counts)?;
        }

        Command::Unique { filters, min_count } => {
            let criteria = app.criteria(&filters)?;
            let values = app.services.unique.get_unique_values().await?;
            let counts = app.services.counts.get_counts(&criteria).await?;

            let mut ranked: BTreeMap<String, Vec<RankedOption>> = BTreeMap::new();
            for (field, options) in &values.fields {
                let field_counts: BTreeMap<String, i64> = counts
                    .per_field
                    .get(field)
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), *v as i64)).collect())
                    .unwrap_or_default();
                let selected: BTreeSet<String> = criteria.values(*field).cloned().collect();
                ranked.insert(
                    field.to_string(),
                    rank_options(options, &field_counts, &selected, min_count),
                );
            }
            for (key, options) in &values.custom_fields {
                let field_counts: BTreeMap<String, i64> = counts
                    .custom_fields
                    .get(key)
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), *v as i64)).collect())
                    .unwrap_or_default();
                ranked.insert(
                    format!("custom.{}", key),
                    rank_options(options, &field_counts, &BTreeSet::new(), min_count),
                );
            }
            print_json(&ranked)?;
        }

        Command::List {
            filters,
            page,
            page_size,
            all,
        } => {
            let criteria = app.criteria(&filters)?;
            if all {
                let page_size = page_size.unwrap_or(app.config.default_page_size);
                let mut query = app.services.query.infinite(criteria.criteria().clone(), page_size);
                query.fetch_all().await?;
                info!(rows = query.rows().len(), pages = query.pages_fetched(), "Fetched all pages");
                print_json(&query.rows())?;
            } else {
                // The saved page belongs to the saved filters
                let saved = app.filter_store().pagination();
                let page = page.unwrap_or(if filters.is_empty() { saved.page } else { 0 });
                let page_size = page_size.unwrap_or(saved.page_size);
                let result = app
                    .services
                    .query
                    .query_leads(&criteria, PageSpec::Offset { page, page_size })
                    .await?;
                print_json(&result)?;
            }
        }

        Command::Assign {
            filters,
            targets,
            equal,
            ids,
            count,
        } => {
            let targets = targets
                .iter()
                .map(|raw| parse_target(raw, equal))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let selection = app.selection(&filters, ids, count)?;
            let mode = if equal {
                DistributionMode::Equal
            } else {
                DistributionMode::Explicit
            };
            let result = app
                .services
                .bulk
                .bulk_assign(BulkAssignRequest {
                    targets,
                    selection,
                    mode,
                })
                .await?;
            progress_line(&result.job);
            print_json(&result.distribution)?;
        }

        Command::Delete { filters, ids, count } => {
            let selection = app.selection(&filters, ids, count)?;
            let result = app.services.bulk.bulk_delete(BulkDeleteRequest { selection }).await?;
            progress_line(&result.job);
            println!("deleted {}", result.deleted_count);
        }

        Command::Job { id, watch } => match app.store.get_job(&id).await? {
            Some(state) if watch && !state.is_terminal() => app.watch_job(&id).await,
            Some(state) => progress_line(&state),
            None => bail!("unknown job {}", id),
        },
    }

    Ok(())
}

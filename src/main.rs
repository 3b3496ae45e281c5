use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vacancy_ingest::companies::CompanyResolver;
use vacancy_ingest::filter::{self, FilterCriteria, RawCriteria};
use vacancy_ingest::ingest::{self, IngestOptions, Pipeline};
use vacancy_ingest::models::{Salary, StoredVacancy};
use vacancy_ingest::{BatchUpserter, Config, Database};

#[derive(Parser)]
#[command(name = "vacancies")]
#[command(about = "Ingest job vacancies into a local database and query them")]
struct Cli {
    /// Database file (overrides VACANCY_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema and seed the target companies
    Init,

    /// Load a JSON file of vacancy payloads
    Ingest {
        /// JSON array, or an API response with `items` / `objects`
        file: PathBuf,

        /// Source tag for payloads that carry none (hh, superjob, ...)
        #[arg(short, long)]
        source: Option<String>,

        /// Collapse vacancies with the same title and employer
        #[arg(long)]
        dedup: bool,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// List stored vacancies, newest first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(short, long, default_value = "0")]
        offset: usize,
    },

    /// Search stored vacancies
    Search {
        /// Only vacancies paid above the average salary
        #[arg(long)]
        above_average: bool,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Show one vacancy
    Show {
        /// Vacancy id on the job board
        source_id: String,
    },

    /// List known companies with their vacancy counts
    Companies,

    /// Delete one vacancy
    Delete {
        source_id: String,
    },

    /// Delete every vacancy whose title contains a keyword
    Purge {
        keyword: String,
    },

    /// Summary statistics
    Stats,
}

/// Values stay strings here; a malformed one only disables its own filter.
#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    min_salary: Option<String>,

    #[arg(long)]
    max_salary: Option<String>,

    /// Keyword in title, description or requirements (repeatable, any matches)
    #[arg(short, long = "keyword")]
    keywords: Vec<String>,

    /// Company name (repeatable)
    #[arg(long = "company")]
    companies: Vec<String>,

    /// Internal company id (repeatable)
    #[arg(long = "company-id")]
    company_ids: Vec<String>,

    /// Employer id on a job board, as SOURCE:ID (repeatable)
    #[arg(long = "employer-id")]
    employer_ids: Vec<String>,

    #[arg(long)]
    experience: Option<String>,

    #[arg(long)]
    employment: Option<String>,

    #[arg(long)]
    schedule: Option<String>,

    #[arg(long)]
    area: Option<String>,

    #[arg(long)]
    limit: Option<String>,

    /// salary or recency
    #[arg(long)]
    sort: Option<String>,
}

impl FilterArgs {
    fn into_criteria(self) -> FilterCriteria {
        let mut external_ids = std::collections::BTreeMap::<String, Vec<String>>::new();
        for pair in self.employer_ids {
            match pair.split_once(':') {
                Some((source, id)) => external_ids
                    .entry(source.to_string())
                    .or_default()
                    .push(id.trim().to_string()),
                None => tracing::warn!(value = %pair, "ignoring --employer-id without SOURCE:"),
            }
        }
        FilterCriteria::from_raw(RawCriteria {
            min_salary: self.min_salary.map(Value::String),
            max_salary: self.max_salary.map(Value::String),
            keywords: Some(self.keywords),
            company_ids: Some(self.company_ids.into_iter().map(Value::String).collect()),
            company_names: Some(self.companies),
            external_ids: Some(external_ids),
            experience: self.experience,
            employment: self.employment,
            schedule: self.schedule,
            area: self.area,
            limit: self.limit.map(Value::String),
            sort: self.sort,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(path) = cli.db {
        config = config.with_database_path(path);
    }
    let mut db = Database::open(&config).with_context(|| {
        format!("Failed to open database at {}", config.database_path.display())
    })?;
    db.ensure_schema().context("Failed to create schema")?;

    match cli.command {
        Commands::Init => {
            let seeded = db.seed_target_companies()?;
            println!("Database initialized at {}", db.path().display());
            println!("Seeded {} target companies", seeded);
        }

        Commands::Ingest {
            file,
            source,
            dedup,
            filter,
        } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let batch = ingest::parse_batch(&json, source.as_deref())
                .with_context(|| format!("{} is not a vacancy list", file.display()))?;
            if batch.rejected > 0 {
                println!("Rejected {} malformed payload(s)", batch.rejected);
            }

            let upserter = BatchUpserter::new(CompanyResolver::default(), config.preview_limit);
            let options = IngestOptions {
                deduplicate: dedup,
                criteria: Some(filter.into_criteria()),
            };
            let report = Pipeline::new(upserter)
                .run(&mut db, batch.records, &options)
                .context("Batch upsert failed")?;

            for message in &report.messages {
                println!("  {}", message);
            }
            println!("\nResults:");
            println!("  New:       {}", report.inserted);
            println!("  Updated:   {}", report.updated);
            println!("  Unchanged: {}", report.unchanged);
            if report.skipped > 0 {
                println!("  Skipped:   {}", report.skipped);
            }
        }

        Commands::List { limit, offset } => {
            let vacancies = db.load_vacancies(Some(limit), offset);
            print_vacancies(&vacancies);
        }

        Commands::Search {
            above_average,
            filter: args,
        } => {
            let criteria = args.into_criteria();
            let vacancies = if above_average {
                filter::apply_stored(db.vacancies_above_average_salary(), &criteria)
            } else {
                db.search_vacancies(&criteria)
            };
            print_vacancies(&vacancies);
        }

        Commands::Show { source_id } => match db.get_vacancy(&source_id) {
            Some(vacancy) => print_vacancy(&vacancy),
            None => println!("Vacancy {} not found.", source_id),
        },

        Commands::Companies => {
            let counts = db.companies_with_vacancy_counts();
            if counts.is_empty() {
                println!("No companies found. Run `vacancies init` to seed them.");
            } else {
                println!("{:<32} {:>10}", "COMPANY", "VACANCIES");
                println!("{}", "-".repeat(43));
                for (name, count) in counts {
                    println!("{:<32} {:>10}", truncate(&name, 30), count);
                }
            }
        }

        Commands::Delete { source_id } => {
            if db.delete_vacancy(&source_id)? {
                println!("Deleted vacancy {}.", source_id);
            } else {
                println!("Vacancy {} not found.", source_id);
            }
        }

        Commands::Purge { keyword } => {
            let removed = db.delete_vacancies_by_keyword(&keyword)?;
            println!("Removed {} vacancy(ies) matching '{}'.", removed, keyword);
        }

        Commands::Stats => {
            let stats = db.database_stats();
            println!("Database: {}", db.path().display());
            println!("Vacancies: {}", stats.total_vacancies);
            println!("With salary: {}", stats.vacancies_with_salary);
            println!("Employers: {}", stats.distinct_employers);
            match db.average_salary() {
                Some(avg) => println!("Average salary: {:.0}", avg),
                None => println!("Average salary: -"),
            }
            match stats.latest_published_at {
                Some(latest) => println!("Latest published: {}", latest.format("%Y-%m-%d %H:%M")),
                None => println!("Latest published: -"),
            }
            let top: Vec<_> = db
                .companies_with_vacancy_counts()
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .take(10)
                .collect();
            if !top.is_empty() {
                println!("\nTop companies:");
                for (name, count) in top {
                    println!("  {:<30} {:>6}", truncate(&name, 28), count);
                }
            }
        }
    }

    Ok(())
}

fn print_vacancies(vacancies: &[StoredVacancy]) {
    if vacancies.is_empty() {
        println!("No vacancies found.");
        return;
    }
    println!("{:<12} {:<34} {:<22} {:>18}", "ID", "TITLE", "EMPLOYER", "SALARY");
    println!("{}", "-".repeat(89));
    for vacancy in vacancies {
        let record = &vacancy.record;
        let employer = vacancy
            .company_name
            .as_deref()
            .unwrap_or(&record.employer.name);
        println!(
            "{:<12} {:<34} {:<22} {:>18}",
            truncate(&record.source_id, 12),
            truncate(&record.title, 32),
            truncate(employer, 20),
            salary_range(record.salary.as_ref())
        );
    }
}

fn print_vacancy(vacancy: &StoredVacancy) {
    let record = &vacancy.record;
    println!("Vacancy {}", record.source_id);
    println!("Title: {}", record.title);
    if !record.employer.name.is_empty() {
        println!("Employer: {}", record.employer.name);
    }
    if let Some(company) = &vacancy.company_name {
        println!("Company: {}", company);
    }
    println!("URL: {}", record.url);
    println!("Salary: {}", salary_range(record.salary.as_ref()));
    for (label, value) in [
        ("Source", &record.source),
        ("Area", &record.area),
        ("Experience", &record.experience),
        ("Employment", &record.employment),
        ("Schedule", &record.schedule),
    ] {
        if let Some(value) = value {
            println!("{}: {}", label, value);
        }
    }
    if let Some(published) = record.published_at {
        println!("Published: {}", published.format("%Y-%m-%d %H:%M"));
    }
    println!("Stored: {} (updated {})", vacancy.created_at, vacancy.updated_at);

    for (heading, text) in [
        ("Requirements", &record.requirements),
        ("Responsibilities", &record.responsibilities),
        ("Description", &record.description),
    ] {
        if let Some(text) = text {
            println!("\n--- {} ---\n{}", heading, textwrap::fill(text, 80));
        }
    }
}

fn salary_range(salary: Option<&Salary>) -> String {
    let Some(salary) = salary else {
        return "-".to_string();
    };
    let currency = salary.currency.as_deref().unwrap_or("");
    let range = match (salary.from, salary.to) {
        (Some(from), Some(to)) => format!("{}-{}", from, to),
        (Some(from), None) => format!("from {}", from),
        (None, Some(to)) => format!("up to {}", to),
        (None, None) => return "-".to_string(),
    };
    format!("{} {}", range, currency).trim_end().to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

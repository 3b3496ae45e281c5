//! Employer-name to company-id resolution.
//!
//! A [`CompanyMapping`] is built once per batch from the `companies` table and
//! the shared [`AliasTable`], then passed explicitly to whoever needs it.
//! Resolution is a pure lookup against that mapping.

use std::collections::{BTreeMap, HashMap};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::models::{CompanyRecord, Employer, VacancyRecord};

/// Names and aliases at or below these lengths never take part in fuzzy matching.
const MIN_SUBSTRING_NAME_CHARS: usize = 3;
const MIN_ALIAS_CHARS: usize = 2;

pub struct TargetCompany {
    pub name: &'static str,
    pub hh_id: &'static str,
    pub description: &'static str,
}

/// Companies seeded by `vacancies init`.
pub const TARGET_COMPANIES: &[TargetCompany] = &[
    TargetCompany {
        name: "Яндекс",
        hh_id: "1740",
        description: "Поисковая система и интернет-сервисы",
    },
    TargetCompany {
        name: "Тинькофф",
        hh_id: "78638",
        description: "Банк и экосистема финансовых сервисов",
    },
    TargetCompany {
        name: "СБЕР",
        hh_id: "3529",
        description: "Банк и финтех-экосистема",
    },
    TargetCompany {
        name: "Wildberries",
        hh_id: "64174",
        description: "Интернет-ритейлер",
    },
    TargetCompany {
        name: "OZON",
        hh_id: "2180",
        description: "E-commerce площадка",
    },
    TargetCompany {
        name: "VK (ВКонтакте)",
        hh_id: "15478",
        description: "Социальные сети и интернет-сервисы",
    },
    TargetCompany {
        name: "Kaspersky",
        hh_id: "1057",
        description: "Системы защиты информации",
    },
    TargetCompany {
        name: "Авито",
        hh_id: "84585",
        description: "Сервис объявлений",
    },
    TargetCompany {
        name: "X5 Retail Group",
        hh_id: "4934",
        description: "Продуктовая розничная сеть",
    },
    TargetCompany {
        name: "Ростелеком",
        hh_id: "2748",
        description: "Телекоммуникационный провайдер",
    },
    TargetCompany {
        name: "Альфа-Банк",
        hh_id: "80",
        description: "Частный банк",
    },
    TargetCompany {
        name: "JetBrains",
        hh_id: "1122",
        description: "Инструменты разработки",
    },
    TargetCompany {
        name: "2GIS",
        hh_id: "64356",
        description: "Справочно-навигационные сервисы",
    },
    TargetCompany {
        name: "Skyeng",
        hh_id: "1201321",
        description: "Онлайн-образование",
    },
    TargetCompany {
        name: "Delivery Club",
        hh_id: "633442",
        description: "Доставка еды",
    },
];

/// Canonical name fragment -> alternative spellings seen in employer text.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: BTreeMap<String, Vec<String>>,
}

impl Default for AliasTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert("яндекс", &["yandex"]);
        table.insert("тинькофф", &["т-банк", "tinkoff", "t-bank", "tcs"]);
        table.insert("сбер", &["сбербанк", "sberbank", "sber"]);
        table.insert("wildberries", &["wb", "вайлдберриз"]);
        table.insert("ozon", &["озон"]);
        table.insert("vk", &["вконтакте", "вк", "mail.ru group", "vk group"]);
        table.insert(
            "kaspersky",
            &["лаборатория касперского", "касперский"],
        );
        table.insert("авито", &["avito"]);
        table.insert("x5 retail group", &["x5", "x5 tech", "пятёрочка"]);
        table.insert("ростелеком", &["rostelecom"]);
        table.insert("альфа-банк", &["alfa-bank", "alfabank"]);
        table.insert("jetbrains", &["джетбрейнс"]);
        table.insert("2gis", &["2гис", "дубльгис"]);
        table.insert("skyeng", &["скайэнг"]);
        table.insert("delivery club", &["деливери клаб"]);
        table
    }
}

impl AliasTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, canonical: &str, aliases: &[&str]) {
        let entry = self.entries.entry(normalize_name(canonical)).or_default();
        for alias in aliases {
            let alias = normalize_name(alias);
            if !entry.contains(&alias) {
                entry.push(alias);
            }
        }
    }

    /// Aliases whose canonical fragment occurs in `company_name`.
    pub fn aliases_for(&self, company_name: &str) -> Vec<String> {
        let normalized = normalize_name(company_name);
        self.entries
            .iter()
            .filter(|(canonical, _)| normalized.contains(canonical.as_str()))
            .flat_map(|(_, aliases)| aliases.iter().cloned())
            .collect()
    }
}

/// Batch-scoped lookup tables derived from the known companies.
#[derive(Debug, Clone, Default)]
pub struct CompanyMapping {
    names: HashMap<String, i64>,
    // longest first, so the most specific name wins a substring tie
    substring_names: Vec<(String, i64)>,
    aliases: Vec<(String, i64)>,
    external_ids: HashMap<(String, String), i64>,
}

impl CompanyMapping {
    pub fn build(companies: &[CompanyRecord]) -> Self {
        let mut mapping = Self::default();
        for company in companies {
            let name = normalize_name(&company.name);
            mapping.names.entry(name.clone()).or_insert(company.id);
            if name.chars().count() > MIN_SUBSTRING_NAME_CHARS {
                mapping.substring_names.push((name, company.id));
            }
            for alias in &company.aliases {
                let alias = normalize_name(alias);
                if alias.chars().count() > MIN_ALIAS_CHARS
                    && !mapping.aliases.iter().any(|(a, _)| *a == alias)
                {
                    mapping.aliases.push((alias, company.id));
                }
            }
            for (source, external_id) in &company.external_ids {
                mapping
                    .external_ids
                    .insert((source.to_lowercase(), external_id.clone()), company.id);
            }
        }
        sort_longest_first(&mut mapping.substring_names);
        sort_longest_first(&mut mapping.aliases);
        mapping
    }

    /// One read of the `companies` table. Errors fail the batch.
    pub fn load(conn: &Connection, aliases: &AliasTable) -> StoreResult<Self> {
        let companies = load_companies(conn, aliases).map_err(StoreError::CompanyMapping)?;
        let mapping = Self::build(&companies);
        info!(
            companies = companies.len(),
            aliases = mapping.aliases.len(),
            "company mapping loaded"
        );
        Ok(mapping)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Exact name, then substring, then alias, then the source-specific
    /// external id. `None` is an ordinary outcome.
    pub fn resolve(&self, employer: &Employer, source: Option<&str>) -> Option<i64> {
        let text = normalize_name(&employer.name);
        if text.is_empty() {
            return None;
        }

        if let Some(&id) = self.names.get(&text) {
            return Some(id);
        }

        let text_words: Vec<&str> = words(&text).collect();
        let text_is_long = text.chars().count() > MIN_SUBSTRING_NAME_CHARS;
        for (name, id) in &self.substring_names {
            if text.contains(name.as_str()) || (text_is_long && leads_name(name, &text_words)) {
                return Some(*id);
            }
        }

        for (alias, id) in &self.aliases {
            if text.contains(alias.as_str()) {
                return Some(*id);
            }
        }

        let external_id = employer.external_id.as_deref()?;
        let source = source?.to_lowercase();
        self.external_ids
            .get(&(source, external_id.to_string()))
            .copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompanyResolver {
    aliases: AliasTable,
}

impl CompanyResolver {
    pub fn new(aliases: AliasTable) -> Self {
        Self { aliases }
    }

    pub fn load_mapping(&self, conn: &Connection) -> StoreResult<CompanyMapping> {
        CompanyMapping::load(conn, &self.aliases)
    }

    /// Sets `company_id` on every record; returns how many were resolved.
    pub fn annotate(&self, mapping: &CompanyMapping, records: &mut [VacancyRecord]) -> usize {
        if mapping.is_empty() {
            debug!("no known companies, company ids stay empty");
        }
        let mut resolved = 0;
        for record in records.iter_mut() {
            record.company_id = mapping.resolve(&record.employer, record.source.as_deref());
            if record.company_id.is_some() {
                resolved += 1;
            } else if !record.employer.name.is_empty() {
                debug!(employer = %record.employer.name, "no company match");
            }
        }
        resolved
    }
}

pub(crate) fn load_companies(
    conn: &Connection,
    aliases: &AliasTable,
) -> rusqlite::Result<Vec<CompanyRecord>> {
    let mut stmt = conn.prepare("SELECT id, name, external_id, source FROM companies ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let external_id: Option<String> = row.get(2)?;
        let source: Option<String> = row.get(3)?;
        let mut external_ids = BTreeMap::new();
        if let (Some(source), Some(external_id)) = (source, external_id) {
            external_ids.insert(source, external_id);
        }
        Ok(CompanyRecord {
            id: row.get(0)?,
            aliases: aliases.aliases_for(&name),
            name,
            external_ids,
        })
    })?;
    rows.collect()
}

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

/// Employer text naming a company only by a shortened form ("Delivery" for
/// "Delivery Club") must be the leading whole words of that name.
fn leads_name(name: &str, text_words: &[&str]) -> bool {
    if text_words.is_empty() {
        return false;
    }
    let name_words: Vec<&str> = words(name).collect();
    name_words.starts_with(text_words)
}

fn sort_longest_first(entries: &mut [(String, i64)]) {
    entries.sort_by(|a, b| {
        b.0.chars()
            .count()
            .cmp(&a.0.chars().count())
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(id: i64, name: &str, aliases: &AliasTable) -> CompanyRecord {
        CompanyRecord {
            id,
            name: name.to_string(),
            external_ids: BTreeMap::new(),
            aliases: aliases.aliases_for(name),
        }
    }

    fn yandex_only() -> CompanyMapping {
        let mut aliases = AliasTable::empty();
        aliases.insert("яндекс", &["yandex"]);
        CompanyMapping::build(&[company(7, "Яндекс", &aliases)])
    }

    #[test]
    fn exact_and_alias_paths_agree() {
        let mapping = yandex_only();
        assert_eq!(mapping.resolve(&Employer::named("Яндекс"), None), Some(7));
        assert_eq!(mapping.resolve(&Employer::named("Yandex LLC"), None), Some(7));
    }

    #[test]
    fn empty_employer_never_matches() {
        let mapping = yandex_only();
        assert_eq!(mapping.resolve(&Employer::named("   "), None), None);
    }

    #[test]
    fn substring_both_directions() {
        let aliases = AliasTable::empty();
        let mapping = CompanyMapping::build(&[
            company(1, "JetBrains", &aliases),
            company(2, "Delivery Club", &aliases),
        ]);
        assert_eq!(
            mapping.resolve(&Employer::named("JetBrains s.r.o."), None),
            Some(1)
        );
        assert_eq!(mapping.resolve(&Employer::named("Delivery"), None), Some(2));
        // too short to be looked up inside a company name
        assert_eq!(mapping.resolve(&Employer::named("jet"), None), None);
    }

    #[test]
    fn generic_words_do_not_resolve_to_targets() {
        let aliases = AliasTable::default();
        let companies: Vec<CompanyRecord> = TARGET_COMPANIES
            .iter()
            .enumerate()
            .map(|(i, target)| company(i as i64 + 1, target.name, &aliases))
            .collect();
        let mapping = CompanyMapping::build(&companies);
        for text in ["Group", "Retail", "Банк", "Club", "Brains", "Retail Group"] {
            assert_eq!(mapping.resolve(&Employer::named(text), None), None, "{text}");
        }
        assert_eq!(mapping.resolve(&Employer::named("Альфа"), None), Some(11));
        assert_eq!(mapping.resolve(&Employer::named("X5 Retail"), None), Some(9));
    }

    #[test]
    fn short_names_skip_substring_matching() {
        let aliases = AliasTable::empty();
        let mapping = CompanyMapping::build(&[company(3, "МТС", &aliases)]);
        assert_eq!(mapping.resolve(&Employer::named("мтс"), None), Some(3));
        assert_eq!(mapping.resolve(&Employer::named("МТС Диджитал"), None), None);
    }

    #[test]
    fn short_aliases_are_ignored() {
        let aliases = AliasTable::default();
        let mapping = CompanyMapping::build(&[company(4, "Wildberries", &aliases)]);
        // "wb" is two characters long
        assert_eq!(mapping.resolve(&Employer::named("WB Tech"), None), None);
        assert_eq!(
            mapping.resolve(&Employer::named("ООО Вайлдберриз"), None),
            Some(4)
        );
    }

    #[test]
    fn longest_name_wins_substring_tie() {
        let aliases = AliasTable::empty();
        let mapping = CompanyMapping::build(&[
            company(1, "Альфа", &aliases),
            company(2, "Альфа-Банк", &aliases),
        ]);
        assert_eq!(
            mapping.resolve(&Employer::named("АО Альфа-Банк"), None),
            Some(2)
        );
    }

    #[test]
    fn external_id_is_source_specific_fallback() {
        let mut record = company(9, "Skyeng", &AliasTable::empty());
        record.external_ids.insert("hh".into(), "1201321".into());
        let mapping = CompanyMapping::build(&[record]);
        let employer = Employer {
            name: "Онлайн-школа английского".into(),
            external_id: Some("1201321".into()),
        };
        assert_eq!(mapping.resolve(&employer, Some("HH")), Some(9));
        assert_eq!(mapping.resolve(&employer, Some("superjob")), None);
        assert_eq!(mapping.resolve(&employer, None), None);
    }

    #[test]
    fn annotate_counts_resolved_records() {
        let resolver = CompanyResolver::default();
        let mapping = yandex_only();
        let mut records = vec![
            VacancyRecord {
                employer: Employer::named("Yandex"),
                ..VacancyRecord::new("1", "Dev", "u1")
            },
            VacancyRecord {
                employer: Employer::named("Unknown Startup"),
                ..VacancyRecord::new("2", "Dev", "u2")
            },
        ];
        assert_eq!(resolver.annotate(&mapping, &mut records), 1);
        assert_eq!(records[0].company_id, Some(7));
        assert_eq!(records[1].company_id, None);
    }

    #[test]
    fn annotate_with_empty_mapping_resolves_nothing() {
        let resolver = CompanyResolver::default();
        let mapping = CompanyMapping::build(&[]);
        assert!(mapping.is_empty());
        let mut records = vec![VacancyRecord {
            employer: Employer::named("Яндекс"),
            company_id: Some(7),
            ..VacancyRecord::new("1", "Dev", "u1")
        }];
        assert_eq!(resolver.annotate(&mapping, &mut records), 0);
        assert_eq!(records[0].company_id, None);
    }

    #[test]
    fn load_reads_companies_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE companies (
                 id INTEGER PRIMARY KEY, name TEXT, external_id TEXT, source TEXT
             );
             INSERT INTO companies VALUES (1, 'Яндекс', '1740', 'hh');",
        )
        .unwrap();
        let mapping = CompanyMapping::load(&conn, &AliasTable::default()).unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.resolve(&Employer::named("yandex cloud"), None), Some(1));
    }

    #[test]
    fn load_fails_without_companies_table() {
        let conn = Connection::open_in_memory().unwrap();
        let err = CompanyMapping::load(&conn, &AliasTable::default()).unwrap_err();
        assert!(matches!(err, StoreError::CompanyMapping(_)));
    }
}

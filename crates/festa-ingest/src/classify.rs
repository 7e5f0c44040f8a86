//! Region and category classification driven by the YAML rule tables in `rules/`.

use std::path::Path;

use anyhow::Context;
use festa_core::{ApprovalStatus, Category, EventDraft, NormalizedEvent, Region};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BUILTIN_REGIONS: &str = include_str!("../../../rules/regions.yaml");
const BUILTIN_CATEGORIES: &str = include_str!("../../../rules/categories.yaml");

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("parsing rule file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("bad pattern {pattern:?} for category {category}: {source}")]
    Pattern {
        category: Category,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{kind} {code} is listed twice")]
    Duplicate { kind: &'static str, code: String },
}

#[derive(Debug, Deserialize)]
struct RegionRulesFile {
    regions: Vec<RegionRuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RegionRuleSpec {
    code: Region,
    name: String,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryRulesFile {
    categories: Vec<CategoryRuleSpec>,
}

#[derive(Debug, Deserialize)]
struct CategoryRuleSpec {
    code: Category,
    label: String,
    color: String,
    icon: String,
    #[serde(default)]
    patterns: Vec<String>,
}

/// Presentation metadata for one category code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryMeta {
    pub code: Category,
    pub label: String,
    pub color: String,
    pub icon: String,
}

#[derive(Debug, Clone)]
struct RegionRule {
    region: Region,
    name: String,
    keywords: Vec<String>,
}

#[derive(Debug, Clone)]
struct CategoryRule {
    meta: CategoryMeta,
    patterns: Vec<Regex>,
}

/// Pure and total: every draft gets a region and a category.
#[derive(Debug, Clone)]
pub struct Classifier {
    regions: Vec<RegionRule>,
    categories: Vec<CategoryRule>,
}

impl Classifier {
    /// Rules compiled into the binary.
    pub fn builtin() -> Result<Self, RulesError> {
        Self::from_yaml(BUILTIN_REGIONS, BUILTIN_CATEGORIES)
    }

    /// Reads `regions.yaml` and `categories.yaml` from `dir`.
    pub fn from_dir(dir: &Path) -> anyhow::Result<Self> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        };
        let regions = read("regions.yaml")?;
        let categories = read("categories.yaml")?;
        Self::from_yaml(&regions, &categories)
            .with_context(|| format!("loading rules from {}", dir.display()))
    }

    pub fn from_yaml(regions: &str, categories: &str) -> Result<Self, RulesError> {
        let regions: RegionRulesFile = serde_yaml::from_str(regions)?;
        let categories: CategoryRulesFile = serde_yaml::from_str(categories)?;

        let mut region_rules: Vec<RegionRule> = Vec::with_capacity(regions.regions.len());
        for spec in regions.regions {
            if region_rules.iter().any(|r| r.region == spec.code) {
                return Err(RulesError::Duplicate {
                    kind: "region",
                    code: spec.code.to_string(),
                });
            }
            region_rules.push(RegionRule {
                region: spec.code,
                name: spec.name,
                keywords: spec
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect(),
            });
        }

        let mut category_rules: Vec<CategoryRule> = Vec::with_capacity(categories.categories.len());
        for spec in categories.categories {
            if category_rules.iter().any(|c| c.meta.code == spec.code) {
                return Err(RulesError::Duplicate {
                    kind: "category",
                    code: spec.code.to_string(),
                });
            }
            let patterns = spec
                .patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .map_err(|source| RulesError::Pattern {
                            category: spec.code,
                            pattern: p.clone(),
                            source,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            category_rules.push(CategoryRule {
                meta: CategoryMeta {
                    code: spec.code,
                    label: spec.label,
                    color: spec.color,
                    icon: spec.icon,
                },
                patterns,
            });
        }

        Ok(Self {
            regions: region_rules,
            categories: category_rules,
        })
    }

    /// First region, in table order, with a keyword contained in `text`.
    pub fn region_for(&self, text: &str) -> Region {
        let text = text.to_lowercase();
        self.regions
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| text.contains(k.as_str())))
            .map(|rule| rule.region)
            .unwrap_or(Region::Nationwide)
    }

    pub fn category_for(&self, title: &str, description: &str) -> Category {
        let text = format!("{title} {description}").to_lowercase();
        self.categories
            .iter()
            .find(|rule| rule.patterns.iter().any(|p| p.is_match(&text)))
            .map(|rule| rule.meta.code)
            .unwrap_or(Category::Other)
    }

    pub fn classify(&self, draft: EventDraft) -> NormalizedEvent {
        let region_text = if draft.location.trim().is_empty() {
            draft.title.as_str()
        } else {
            draft.location.as_str()
        };
        let region = self.region_for(region_text);
        let category = draft
            .category_hint
            .unwrap_or_else(|| self.category_for(&draft.title, &draft.description));

        NormalizedEvent {
            source_id: draft.source_id,
            title: draft.title,
            category,
            region,
            start_date: draft.start_date,
            end_date: draft.end_date,
            location: draft.location,
            is_free: draft.is_free,
            price: draft.price,
            image_url: draft.image_url,
            organizer: draft.organizer,
            description: draft.description,
            website_url: draft.website_url,
            source_url: draft.source_url,
            approval_status: Some(ApprovalStatus::Pending),
            crawled_at: draft.crawled_at,
        }
    }

    pub fn category_meta(&self, code: Category) -> Option<&CategoryMeta> {
        self.categories.iter().map(|c| &c.meta).find(|m| m.code == code)
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryMeta> {
        self.categories.iter().map(|c| &c.meta)
    }

    pub fn region_name(&self, code: Region) -> Option<&str> {
        self.regions
            .iter()
            .find(|r| r.region == code)
            .map(|r| r.name.as_str())
    }
}

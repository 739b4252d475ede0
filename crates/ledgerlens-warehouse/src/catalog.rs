//! Metric Query Catalog.
//!
//! A read-only registry of [`MetricQueryTemplate`]s keyed by `(name, granularity)`.
//! Every template declares the single relation it reads from; the composer walks
//! those declarations down to the session ledger. Adding a metric means
//! registering a template through [`MetricCatalogBuilder`].

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::Serialize;

use crate::activity::{DAILY_ACTIVITY, DAILY_ACTIVITY_BODY, LEDGER_STAGE};
use crate::{templates, Granularity, WarehouseError};

/// Standard metric families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    DailyActivity,
    ActivityTrend,
    RevenueTrend,
    UserRetention,
    RevenueRetention,
    QuickRatio,
    RevenueQuickRatio,
    CohortRetention,
    CohortLtv,
}

impl MetricFamily {
    /// Families computed for one granularity in an analysis workbook.
    pub const WORKBOOK: [Self; 8] = [
        Self::ActivityTrend,
        Self::RevenueTrend,
        Self::UserRetention,
        Self::RevenueRetention,
        Self::QuickRatio,
        Self::RevenueQuickRatio,
        Self::CohortRetention,
        Self::CohortLtv,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DailyActivity => DAILY_ACTIVITY,
            Self::ActivityTrend => "activity_trend",
            Self::RevenueTrend => "revenue_trend",
            Self::UserRetention => "user_retention",
            Self::RevenueRetention => "revenue_retention",
            Self::QuickRatio => "quick_ratio",
            Self::RevenueQuickRatio => "revenue_quick_ratio",
            Self::CohortRetention => "cohort_retention",
            Self::CohortLtv => "cohort_ltv",
        }
    }
}

impl Display for MetricFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricFamily {
    type Err = WarehouseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [Self::DailyActivity]
            .into_iter()
            .chain(Self::WORKBOOK)
            .find(|family| family.as_str() == value)
            .ok_or_else(|| WarehouseError::Catalog(format!("unknown metric family '{value}'")))
    }
}

/// The relation a template reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dependency {
    /// The session-scoped raw ledger.
    Ledger,
    /// The output of another template.
    Template {
        name: String,
        granularity: Granularity,
    },
}

impl Dependency {
    pub fn template(name: impl Into<String>, granularity: Granularity) -> Self {
        Self::Template {
            name: name.into(),
            granularity,
        }
    }

    /// Name of the relation the dependent body selects from.
    pub fn relation(&self) -> &str {
        match self {
            Self::Ledger => LEDGER_STAGE,
            Self::Template { name, .. } => name,
        }
    }
}

/// An immutable, named query over exactly one upstream relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricQueryTemplate {
    name: String,
    granularity: Granularity,
    dependency: Dependency,
    date_column: String,
    order_by: Vec<String>,
    #[serde(skip)]
    body: String,
}

impl MetricQueryTemplate {
    /// Create a template ordered by its date column.
    pub fn new(
        name: impl Into<String>,
        granularity: Granularity,
        dependency: Dependency,
        date_column: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let date_column = date_column.into();
        Self {
            name: name.into(),
            granularity,
            dependency,
            order_by: vec![date_column.clone()],
            date_column,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_order_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    /// Column the caller's date window is applied to.
    pub fn date_column(&self) -> &str {
        &self.date_column
    }

    pub fn order_by(&self) -> &[String] {
        &self.order_by
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

type TemplateKey = (String, Granularity);

/// Read-only registry of metric templates.
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    templates: BTreeMap<TemplateKey, MetricQueryTemplate>,
}

impl MetricCatalog {
    /// The standard catalog: daily activity plus eight families at each granularity.
    pub fn standard() -> Self {
        Self {
            templates: standard_templates()
                .into_iter()
                .map(|template| ((template.name.clone(), template.granularity), template))
                .collect(),
        }
    }

    pub fn builder() -> MetricCatalogBuilder {
        MetricCatalogBuilder::default()
    }

    /// Look up a template.
    ///
    /// # Errors
    /// Returns [`WarehouseError::UnknownMetric`] when no template is registered.
    pub fn get(
        &self,
        name: &str,
        granularity: Granularity,
    ) -> Result<&MetricQueryTemplate, WarehouseError> {
        self.templates
            .get(&(name.to_owned(), granularity))
            .ok_or_else(|| WarehouseError::UnknownMetric {
                name: name.to_owned(),
                granularity,
            })
    }

    pub fn contains(&self, name: &str, granularity: Granularity) -> bool {
        self.templates.contains_key(&(name.to_owned(), granularity))
    }

    /// The dependency chain of a template, starting with the template that reads
    /// the ledger and ending with the requested one.
    pub fn resolve(
        &self,
        name: &str,
        granularity: Granularity,
    ) -> Result<Vec<&MetricQueryTemplate>, WarehouseError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.get(name, granularity)?;

        loop {
            if !visited.insert((current.name.as_str(), current.granularity)) {
                return Err(WarehouseError::Catalog(format!(
                    "dependency cycle through '{}' ({})",
                    current.name, current.granularity
                )));
            }
            chain.push(current);

            match &current.dependency {
                Dependency::Ledger => break,
                Dependency::Template {
                    name,
                    granularity,
                } => {
                    current = self.get(name, *granularity).map_err(|_| {
                        WarehouseError::Catalog(format!(
                            "template '{}' depends on unknown template '{name}' ({granularity})",
                            current.name
                        ))
                    })?;
                }
            }
        }

        chain.reverse();
        Ok(chain)
    }

    pub fn templates(&self) -> impl Iterator<Item = &MetricQueryTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Collects templates and validates them into a [`MetricCatalog`].
#[derive(Debug, Clone, Default)]
pub struct MetricCatalogBuilder {
    templates: Vec<MetricQueryTemplate>,
}

impl MetricCatalogBuilder {
    /// Start from the standard templates.
    pub fn standard() -> Self {
        Self {
            templates: standard_templates(),
        }
    }

    #[must_use]
    pub fn template(mut self, template: MetricQueryTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Validate and freeze the catalog.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Catalog`] for invalid identifiers, empty bodies,
    /// duplicate registrations, unknown dependencies, cycles, or chains that reuse
    /// a relation name.
    pub fn build(self) -> Result<MetricCatalog, WarehouseError> {
        let mut templates = BTreeMap::new();
        for template in self.templates {
            validate_template(&template)?;
            let key = (template.name.clone(), template.granularity);
            if templates.contains_key(&key) {
                return Err(WarehouseError::Catalog(format!(
                    "template '{}' ({}) registered twice",
                    template.name, template.granularity
                )));
            }
            templates.insert(key, template);
        }

        let catalog = MetricCatalog { templates };
        for template in catalog.templates() {
            let chain = catalog.resolve(&template.name, template.granularity)?;
            let mut names = HashSet::new();
            if let Some(duplicate) = chain.iter().find(|stage| !names.insert(stage.name.as_str())) {
                return Err(WarehouseError::Catalog(format!(
                    "dependency chain of '{}' ({}) uses relation '{}' twice",
                    template.name, template.granularity, duplicate.name
                )));
            }
        }

        Ok(catalog)
    }
}

fn validate_template(template: &MetricQueryTemplate) -> Result<(), WarehouseError> {
    let identifiers = std::iter::once(template.name.as_str())
        .chain(std::iter::once(template.date_column.as_str()))
        .chain(template.order_by.iter().map(String::as_str));
    for identifier in identifiers {
        if !is_identifier(identifier) {
            return Err(WarehouseError::Catalog(format!(
                "'{identifier}' in template '{}' is not a plain identifier",
                template.name
            )));
        }
    }
    if template.name == LEDGER_STAGE {
        return Err(WarehouseError::Catalog(format!(
            "'{LEDGER_STAGE}' is reserved for the session ledger"
        )));
    }
    if template.body.trim().is_empty() {
        return Err(WarehouseError::Catalog(format!(
            "template '{}' has an empty body",
            template.name
        )));
    }
    Ok(())
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_lowercase() || first == '_')
        && chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
        && value.len() <= 63
}

fn standard_templates() -> Vec<MetricQueryTemplate> {
    let mut standard = vec![MetricQueryTemplate::new(
        DAILY_ACTIVITY,
        Granularity::Day,
        Dependency::Ledger,
        "activity_date",
        DAILY_ACTIVITY_BODY,
    )
    .with_order_by(["user_id", "activity_date"])];

    let daily = || Dependency::template(DAILY_ACTIVITY, Granularity::Day);
    for granularity in Granularity::ALL {
        let activity = || Dependency::template(MetricFamily::ActivityTrend.as_str(), granularity);
        let revenue = || Dependency::template(MetricFamily::RevenueTrend.as_str(), granularity);
        let cohorts = || Dependency::template(MetricFamily::CohortRetention.as_str(), granularity);

        standard.extend([
            MetricQueryTemplate::new(
                MetricFamily::ActivityTrend.as_str(),
                granularity,
                daily(),
                "period",
                templates::activity_trend(granularity),
            ),
            MetricQueryTemplate::new(
                MetricFamily::RevenueTrend.as_str(),
                granularity,
                daily(),
                "period",
                templates::revenue_trend(granularity),
            ),
            MetricQueryTemplate::new(
                MetricFamily::UserRetention.as_str(),
                granularity,
                activity(),
                "period",
                templates::user_retention(),
            ),
            MetricQueryTemplate::new(
                MetricFamily::RevenueRetention.as_str(),
                granularity,
                revenue(),
                "period",
                templates::revenue_retention(),
            ),
            MetricQueryTemplate::new(
                MetricFamily::QuickRatio.as_str(),
                granularity,
                activity(),
                "period",
                templates::quick_ratio(),
            ),
            MetricQueryTemplate::new(
                MetricFamily::RevenueQuickRatio.as_str(),
                granularity,
                revenue(),
                "period",
                templates::revenue_quick_ratio(),
            ),
            MetricQueryTemplate::new(
                MetricFamily::CohortRetention.as_str(),
                granularity,
                daily(),
                "cohort_start",
                templates::cohort_retention(granularity),
            )
            .with_order_by(["cohort_start", "periods_since_first"]),
            MetricQueryTemplate::new(
                MetricFamily::CohortLtv.as_str(),
                granularity,
                cohorts(),
                "cohort_start",
                templates::cohort_ltv(),
            )
            .with_order_by(["cohort_start", "periods_since_first"]),
        ]);
    }

    standard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_passes_validation() {
        let built = MetricCatalogBuilder::standard().build().expect("valid");
        assert_eq!(built.len(), MetricCatalog::standard().len());
        assert_eq!(built.len(), 1 + 8 * Granularity::ALL.len());
    }

    #[test]
    fn resolves_chains_from_the_ledger_up() {
        let catalog = MetricCatalog::standard();
        let chain: Vec<_> = catalog
            .resolve("cohort_ltv", Granularity::Month)
            .expect("resolve")
            .into_iter()
            .map(|template| (template.name(), template.granularity()))
            .collect();

        assert_eq!(
            chain,
            vec![
                ("daily_activity", Granularity::Day),
                ("cohort_retention", Granularity::Month),
                ("cohort_ltv", Granularity::Month),
            ]
        );
    }

    #[test]
    fn unknown_metric_is_reported() {
        let err = MetricCatalog::standard()
            .get("daily_activity", Granularity::Week)
            .expect_err("daily activity is day-only");
        assert!(matches!(err, WarehouseError::UnknownMetric { .. }));
    }

    #[test]
    fn rejects_cycles() {
        let err = MetricCatalog::builder()
            .template(MetricQueryTemplate::new(
                "left",
                Granularity::Day,
                Dependency::template("right", Granularity::Day),
                "period",
                "SELECT * FROM right",
            ))
            .template(MetricQueryTemplate::new(
                "right",
                Granularity::Day,
                Dependency::template("left", Granularity::Day),
                "period",
                "SELECT * FROM left",
            ))
            .build()
            .expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_unknown_dependencies_and_bad_identifiers() {
        let unknown = MetricCatalog::builder()
            .template(MetricQueryTemplate::new(
                "orphan",
                Granularity::Week,
                Dependency::template("missing", Granularity::Week),
                "period",
                "SELECT * FROM missing",
            ))
            .build();
        assert!(matches!(unknown, Err(WarehouseError::Catalog(_))));

        let injected = MetricCatalogBuilder::standard()
            .template(MetricQueryTemplate::new(
                "x; DROP TABLE transactions",
                Granularity::Day,
                Dependency::template(DAILY_ACTIVITY, Granularity::Day),
                "period",
                "SELECT 1",
            ))
            .build();
        assert!(matches!(injected, Err(WarehouseError::Catalog(_))));
    }

    #[test]
    fn rejects_duplicate_registration() {
        let err = MetricCatalogBuilder::standard()
            .template(MetricQueryTemplate::new(
                "quick_ratio",
                Granularity::Week,
                Dependency::template("activity_trend", Granularity::Week),
                "period",
                "SELECT * FROM activity_trend",
            ))
            .build()
            .expect_err("duplicate");
        assert!(err.to_string().contains("registered twice"));
    }
}

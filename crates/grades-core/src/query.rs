//! Search requests: filters, sort orders, pagination, and their validation.
//!
//! Raw caller input arrives as [`SearchParams`] (strings, as a query string
//! would carry them) and is validated once into a [`SearchRequest`]. Out of
//! domain values fail with [`Error::InvalidFilter`].

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  grade::{Borough, Grade},
  normalize::normalize,
};

pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const MAX_PAGE_SIZE: u32 = 100;
const MAX_CUISINE_LEN: usize = 100;

// ─── Pagination ──────────────────────────────────────────────────────────────

/// A 1-based page of `size` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
  number: u32,
  size:   u32,
}

impl Page {
  pub fn new(number: u32, size: u32) -> Result<Self> {
    if number == 0 {
      return Err(Error::InvalidPage("page numbers start at 1".into()));
    }
    if size == 0 || size > MAX_PAGE_SIZE {
      return Err(Error::InvalidPage(format!(
        "page size {size} out of range 1..={MAX_PAGE_SIZE}"
      )));
    }
    Ok(Self { number, size })
  }

  pub fn number(&self) -> u32 { self.number }

  pub fn size(&self) -> u32 { self.size }

  pub fn offset(&self) -> u64 {
    u64::from(self.number - 1) * u64::from(self.size)
  }
}

impl Default for Page {
  fn default() -> Self {
    Self {
      number: 1,
      size:   DEFAULT_PAGE_SIZE,
    }
  }
}

// ─── Filters ─────────────────────────────────────────────────────────────────

/// Grade filter: one exact grade, or the `pending` synonym.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "grade", rename_all = "snake_case")]
pub enum GradeFilter {
  Exact(Grade),
  /// Any of [`Grade::PENDING_SET`].
  Pending,
}

impl GradeFilter {
  pub fn parse(raw: &str) -> Result<Self> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("pending") {
      return Ok(Self::Pending);
    }
    Grade::from_code(trimmed)
      .map(Self::Exact)
      .map_err(|_| Error::InvalidFilter {
        field: "grade",
        value: raw.to_owned(),
      })
  }

  /// The stored grades this filter accepts.
  pub fn grades(&self) -> Vec<Grade> {
    match self {
      Self::Exact(grade) => vec![*grade],
      Self::Pending => Grade::PENDING_SET.to_vec(),
    }
  }
}

/// Independent, optional predicates; present ones are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
  pub borough: Option<Borough>,
  pub grade:   Option<GradeFilter>,
  /// Matches cuisines equal to or starting with this text, ignoring case.
  pub cuisine: Option<String>,
  pub zipcode: Option<String>,
}

impl Filters {
  pub fn is_empty(&self) -> bool {
    self.borough.is_none()
      && self.grade.is_none()
      && self.cuisine.is_none()
      && self.zipcode.is_none()
  }
}

// ─── Sort ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
  /// Similarity, then exact-prefix matches. Without query text this is id
  /// order.
  #[default]
  Relevance,
  NameAsc,
  NameDesc,
  /// Most recently inspected first.
  DateDesc,
  /// A, B, C, then everything else; name within a grade.
  GradeAsc,
}

impl FromStr for SortOrder {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim() {
      "" | "relevance" => Ok(Self::Relevance),
      "name_asc" => Ok(Self::NameAsc),
      "name_desc" => Ok(Self::NameDesc),
      "date_desc" => Ok(Self::DateDesc),
      "grade_asc" => Ok(Self::GradeAsc),
      other => Err(Error::UnknownSort(other.to_owned())),
    }
  }
}

// ─── Request ─────────────────────────────────────────────────────────────────

/// A validated search. The query text is held in normalized form, so
/// requests differing only in casing or punctuation are equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
  query:   Option<String>,
  filters: Filters,
  sort:    SortOrder,
  page:    Page,
}

impl SearchRequest {
  pub fn new(
    text: Option<&str>,
    filters: Filters,
    sort: SortOrder,
    page: Page,
  ) -> Self {
    let query = text.map(normalize).filter(|key| !key.is_empty());
    Self {
      query,
      filters,
      sort,
      page,
    }
  }

  /// Normalized query key, if the request has meaningful query text.
  pub fn query(&self) -> Option<&str> { self.query.as_deref() }

  pub fn filters(&self) -> &Filters { &self.filters }

  pub fn sort(&self) -> SortOrder { self.sort }

  pub fn page(&self) -> Page { self.page }
}

/// Unvalidated search input as the serving layer receives it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
  pub name:     Option<String>,
  pub boro:     Option<String>,
  pub grade:    Option<String>,
  pub cuisine:  Option<String>,
  pub zipcode:  Option<String>,
  pub sort:     Option<String>,
  pub page:     Option<u32>,
  pub per_page: Option<u32>,
}

impl SearchParams {
  pub fn into_request(self) -> Result<SearchRequest> {
    let present = |v: Option<String>| {
      v.map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
    };

    let borough = present(self.boro)
      .map(|raw| {
        Borough::parse(&raw).ok_or(Error::InvalidFilter {
          field: "borough",
          value: raw,
        })
      })
      .transpose()?;

    let grade = present(self.grade)
      .map(|raw| GradeFilter::parse(&raw))
      .transpose()?;

    let cuisine = present(self.cuisine)
      .map(|raw| {
        if raw.chars().count() > MAX_CUISINE_LEN {
          Err(Error::InvalidFilter {
            field: "cuisine",
            value: raw,
          })
        } else {
          Ok(raw)
        }
      })
      .transpose()?;

    let zipcode = present(self.zipcode)
      .map(|raw| {
        if raw.len() == 5 && raw.bytes().all(|b| b.is_ascii_digit()) {
          Ok(raw)
        } else {
          Err(Error::InvalidFilter {
            field: "zipcode",
            value: raw,
          })
        }
      })
      .transpose()?;

    let sort = self
      .sort
      .as_deref()
      .map(SortOrder::from_str)
      .transpose()?
      .unwrap_or_default();

    let page = Page::new(
      self.page.unwrap_or(1),
      self.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
    )?;

    Ok(SearchRequest::new(
      self.name.as_deref(),
      Filters {
        borough,
        grade,
        cuisine,
        zipcode,
      },
      sort,
      page,
    ))
  }
}

//! Numbered and cursor pagination over querysets.
//!
//! Both paginators share one page-computation contract: fetch one row more
//! than the page size to learn whether a next page exists, trim the
//! lookahead row, and wire every content item to its siblings through
//! [`PageItem`]. Pages carry shared `Arc<M>` instances so the sibling links
//! are the same allocations as the content.
//!
//! Paginators are constructed behind `Arc` because each one can hand out
//! its reverse twin: `get_reverse_paginator()` caches mutually, so asking
//! the twin for *its* reverse returns the original pointer.
//!
//! [`Paginator`] serves 1-based page numbers (negative numbers count from
//! the end by delegating to the reverse twin). [`CursorPaginator`] serves
//! keyset pages: the cursor holds the ordering fields' values of the last
//! seen row, and the next page is everything strictly beyond it under the
//! queryset's ordering — for multi-column orderings the comparison is the
//! composite tuple expansion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::executor::DbExecutor;
use crate::model::Model;
use crate::query::clause::{and_, or_, Q};
use crate::query::path::resolve_order_column;
use crate::query::queryset::{Fetched, QuerySet};
use crate::value::Value;
use marrow_core::{OrmError, OrmResult};

/// An opaque position in a cursor-paginated sequence: the ordering fields'
/// values of the last row already seen.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    /// The leading ordering field's value (single-field orderings).
    Single(Value),
    /// One value per ordering field, compared as a tuple.
    Composite(Vec<Value>),
}

/// One page entry: the item plus links to its neighbors in the overall
/// sequence (reaching across page boundaries when the adjacent row was
/// fetched as lookahead).
#[derive(Debug)]
pub struct PageItem<M: Model> {
    /// The item itself.
    pub item: Arc<M>,
    /// The previous item in sequence, if known.
    pub previous: Option<Arc<M>>,
    /// The next item in sequence, if known.
    pub next: Option<Arc<M>>,
}

impl<M: Model> Clone for PageItem<M> {
    fn clone(&self) -> Self {
        Self {
            item: Arc::clone(&self.item),
            previous: self.previous.clone(),
            next: self.next.clone(),
        }
    }
}

/// A numbered page of results.
#[derive(Debug)]
pub struct Page<M: Model> {
    /// The page number as requested (1-based; negative counts from the
    /// end).
    pub number: i64,
    /// The page content with sibling links.
    pub items: Vec<PageItem<M>>,
    /// Whether a page follows this one.
    pub has_next: bool,
    /// Whether a page precedes this one.
    pub has_previous: bool,
}

impl<M: Model> Clone for Page<M> {
    fn clone(&self) -> Self {
        Self {
            number: self.number,
            items: self.items.clone(),
            has_next: self.has_next,
            has_previous: self.has_previous,
        }
    }
}

/// A cursor page of results.
#[derive(Debug, Clone)]
pub struct CursorPage<M: Model> {
    /// The page content with sibling links.
    pub items: Vec<PageItem<M>>,
    /// Whether more rows exist in the direction of travel.
    pub has_next: bool,
    /// The cursor to continue with, present when `has_next`.
    pub next_cursor: Option<Cursor>,
}

fn link_items<M: Model>(
    content: &[Arc<M>],
    leading: Option<&Arc<M>>,
    trailing: Option<&Arc<M>>,
) -> Vec<PageItem<M>> {
    content
        .iter()
        .enumerate()
        .map(|(i, item)| PageItem {
            item: Arc::clone(item),
            previous: if i == 0 {
                leading.cloned()
            } else {
                Some(Arc::clone(&content[i - 1]))
            },
            next: if i + 1 == content.len() {
                trailing.cloned()
            } else {
                Some(Arc::clone(&content[i + 1]))
            },
        })
        .collect()
}

fn require_ordering<M: Model>(queryset: &QuerySet<M>) -> OrmResult<Vec<(bool, String)>> {
    let order = queryset.order_spec();
    if order.is_empty() {
        return Err(OrmError::Configuration(
            "pagination requires an ordered queryset".to_string(),
        ));
    }
    Ok(order)
}

/// A classic 1-based page-number paginator.
pub struct Paginator<M: Model> {
    queryset: QuerySet<M>,
    page_size: usize,
    previous_links: bool,
    page_cache: Mutex<HashMap<i64, Page<M>>>,
    total_cache: Mutex<Option<u64>>,
    reverse_cache: Mutex<Option<Weak<Self>>>,
}

impl<M: Model> std::fmt::Debug for Paginator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("queryset", &self.queryset)
            .field("page_size", &self.page_size)
            .field("previous_links", &self.previous_links)
            .finish_non_exhaustive()
    }
}

impl<M: Model> Paginator<M> {
    /// Creates a paginator over an ordered queryset.
    ///
    /// `page_size == 0` means a single page holding every row. Errors with
    /// [`OrmError::Configuration`] when the queryset is unordered.
    pub fn new(queryset: QuerySet<M>, page_size: usize) -> OrmResult<Arc<Self>> {
        Self::build(queryset, page_size, false)
    }

    /// Like [`new`](Self::new), but each page also fetches the row just
    /// before it so the first item's `previous` link is populated.
    pub fn with_previous_links(queryset: QuerySet<M>, page_size: usize) -> OrmResult<Arc<Self>> {
        Self::build(queryset, page_size, true)
    }

    fn build(queryset: QuerySet<M>, page_size: usize, previous_links: bool) -> OrmResult<Arc<Self>> {
        require_ordering(&queryset)?;
        Ok(Arc::new(Self {
            queryset,
            page_size,
            previous_links,
            page_cache: Mutex::new(HashMap::new()),
            total_cache: Mutex::new(None),
            reverse_cache: Mutex::new(None),
        }))
    }

    /// Returns the paginator over the opposite ordering.
    ///
    /// The twins cache each other: the reverse of the reverse is the same
    /// `Arc` as the paginator this was called on.
    pub fn get_reverse_paginator(self: &Arc<Self>) -> Arc<Self> {
        let mut guard = self
            .reverse_cache
            .lock()
            .expect("paginator cache lock poisoned");
        if let Some(existing) = guard.as_ref().and_then(Weak::upgrade) {
            return existing;
        }
        let reversed = Arc::new(Self {
            queryset: self.queryset.clone().reverse(),
            page_size: self.page_size,
            previous_links: self.previous_links,
            page_cache: Mutex::new(HashMap::new()),
            total_cache: Mutex::new(None),
            reverse_cache: Mutex::new(Some(Arc::downgrade(self))),
        });
        *guard = Some(Arc::downgrade(&reversed));
        reversed
    }

    /// Fetches one page.
    ///
    /// Pages are 1-based; `0` is invalid, and a negative number counts from
    /// the end (page `-1` is the final window under the reverse ordering).
    /// A page number past the last page errors with
    /// [`OrmError::InvalidPage`].
    pub async fn get_page(self: &Arc<Self>, db: &dyn DbExecutor, number: i64) -> OrmResult<Page<M>> {
        if number == 0 {
            return Err(OrmError::InvalidPage(
                "page numbers are 1-based; 0 is not a page".to_string(),
            ));
        }
        if let Some(cached) = self
            .page_cache
            .lock()
            .expect("paginator cache lock poisoned")
            .get(&number)
        {
            return Ok(cached.clone());
        }

        let page = if number < 0 {
            let reversed = self.get_reverse_paginator();
            let mut page = Box::pin(reversed.get_page(db, -number)).await?;
            page.items.reverse();
            for item in &mut page.items {
                std::mem::swap(&mut item.previous, &mut item.next);
            }
            std::mem::swap(&mut page.has_next, &mut page.has_previous);
            page.number = number;
            page
        } else {
            self.fetch_forward_page(db, number).await?
        };

        self.page_cache
            .lock()
            .expect("paginator cache lock poisoned")
            .insert(number, page.clone());
        Ok(page)
    }

    async fn fetch_forward_page(&self, db: &dyn DbExecutor, number: i64) -> OrmResult<Page<M>> {
        debug!(table = M::table_name(), number, "fetching page");
        let mut queryset = self.queryset.clone();

        if self.page_size == 0 {
            if number != 1 {
                return Err(OrmError::InvalidPage(format!(
                    "page {number} contains no results"
                )));
            }
            let rows = queryset.fetch(db).await?;
            let content: Vec<Arc<M>> = rows.iter().map(Fetched::shared).collect();
            return Ok(Page {
                number,
                items: link_items(&content, None, None),
                has_next: false,
                has_previous: false,
            });
        }

        let base_offset = usize::try_from(number - 1).unwrap_or(0) * self.page_size;
        let fetch_leading = self.previous_links && base_offset > 0;
        let (offset, limit) = if fetch_leading {
            (base_offset - 1, self.page_size + 2)
        } else {
            (base_offset, self.page_size + 1)
        };
        let rows = queryset.offset(offset).limit(limit).fetch(db).await?;
        let mut content: Vec<Arc<M>> = rows.iter().map(Fetched::shared).collect();

        let leading = if fetch_leading && !content.is_empty() {
            Some(content.remove(0))
        } else {
            None
        };
        let has_next = content.len() > self.page_size;
        let trailing = if has_next {
            let t = Arc::clone(&content[self.page_size]);
            content.truncate(self.page_size);
            Some(t)
        } else {
            None
        };

        if content.is_empty() && number != 1 {
            return Err(OrmError::InvalidPage(format!(
                "page {number} contains no results"
            )));
        }

        Ok(Page {
            number,
            items: link_items(&content, leading.as_ref(), trailing.as_ref()),
            has_next,
            has_previous: number > 1,
        })
    }

    /// The total row count (cached; ignores pagination windows).
    pub async fn get_total(&self, db: &dyn DbExecutor) -> OrmResult<u64> {
        if let Some(total) = *self
            .total_cache
            .lock()
            .expect("paginator cache lock poisoned")
        {
            return Ok(total);
        }
        let total = self.queryset.count(db).await?;
        *self
            .total_cache
            .lock()
            .expect("paginator cache lock poisoned") = Some(total);
        Ok(total)
    }

    /// The number of pages; at least 1 even for an empty queryset.
    pub async fn get_amount_pages(&self, db: &dyn DbExecutor) -> OrmResult<u64> {
        if self.page_size == 0 {
            return Ok(1);
        }
        let total = self.get_total(db).await?;
        let size = self.page_size as u64;
        Ok(std::cmp::max(1, total.div_ceil(size)))
    }

    /// Drops all cached pages and counts; the next access refetches.
    pub fn clear_caches(&self) {
        self.page_cache
            .lock()
            .expect("paginator cache lock poisoned")
            .clear();
        *self
            .total_cache
            .lock()
            .expect("paginator cache lock poisoned") = None;
        self.queryset.clear_caches();
    }

    /// Returns a restartable iterator over all pages, starting at page 1.
    pub fn paginate(self: &Arc<Self>) -> PageIter<M> {
        PageIter {
            paginator: Arc::clone(self),
            next_page: 1,
            done: false,
        }
    }
}

/// A lazy page iterator; each [`next`](Self::next) call fetches one page.
pub struct PageIter<M: Model> {
    paginator: Arc<Paginator<M>>,
    next_page: i64,
    done: bool,
}

impl<M: Model> PageIter<M> {
    /// Fetches the next page, or `None` once the sequence is exhausted.
    pub async fn next(&mut self, db: &dyn DbExecutor) -> OrmResult<Option<Page<M>>> {
        if self.done {
            return Ok(None);
        }
        let page = match self.paginator.get_page(db, self.next_page).await {
            Ok(page) => page,
            Err(OrmError::InvalidPage(_)) => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.done = !page.has_next;
        self.next_page += 1;
        Ok(Some(page))
    }

    /// Rewinds to page 1; already-cached pages are served from the
    /// paginator's cache.
    pub fn restart(&mut self) {
        self.next_page = 1;
        self.done = false;
    }
}

/// A keyset (cursor) paginator.
pub struct CursorPaginator<M: Model> {
    queryset: QuerySet<M>,
    page_size: usize,
    order: Vec<(bool, String)>,
    reverse_cache: Mutex<Option<Weak<Self>>>,
}

impl<M: Model> std::fmt::Debug for CursorPaginator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorPaginator")
            .field("queryset", &self.queryset)
            .field("page_size", &self.page_size)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl<M: Model> CursorPaginator<M> {
    /// Creates a cursor paginator over an ordered queryset.
    ///
    /// Every ordering field doubles as a cursor field and must be a
    /// non-nullable base column; violations error with
    /// [`OrmError::Configuration`] here, before any query runs.
    pub fn new(queryset: QuerySet<M>, page_size: usize) -> OrmResult<Arc<Self>> {
        let order = require_ordering(&queryset)?;
        for (_, name) in &order {
            let resolved = resolve_order_column(M::meta(), name)?;
            if resolved.column.table_alias.is_some() {
                return Err(OrmError::Configuration(format!(
                    "cursor field '{name}' must be a base column"
                )));
            }
            if resolved.column.null {
                return Err(OrmError::Configuration(format!(
                    "cursor field '{name}' must not be nullable"
                )));
            }
        }
        Ok(Arc::new(Self {
            queryset,
            page_size,
            order,
            reverse_cache: Mutex::new(None),
        }))
    }

    /// Returns the paginator over the opposite ordering; twins cache each
    /// other, so the reverse of the reverse is pointer-equal to `self`.
    pub fn get_reverse_paginator(self: &Arc<Self>) -> Arc<Self> {
        let mut guard = self
            .reverse_cache
            .lock()
            .expect("paginator cache lock poisoned");
        if let Some(existing) = guard.as_ref().and_then(Weak::upgrade) {
            return existing;
        }
        let reversed_queryset = self.queryset.clone().reverse();
        let order = reversed_queryset.order_spec();
        let reversed = Arc::new(Self {
            queryset: reversed_queryset,
            page_size: self.page_size,
            order,
            reverse_cache: Mutex::new(Some(Arc::downgrade(self))),
        });
        *guard = Some(Arc::downgrade(&reversed));
        reversed
    }

    /// Builds the strict-beyond filter for a cursor: rows whose ordering
    /// tuple sorts after the cursor's. For a single ordering field this is
    /// one comparison; for several, the composite tuple expansion
    /// `(a > ca) OR (a = ca AND b > cb) OR ...` with the comparison
    /// direction following each field's sort direction.
    fn cursor_filter(&self, cursor: &Cursor) -> OrmResult<Q> {
        let values: Vec<Value> = match cursor {
            Cursor::Single(v) => vec![v.clone()],
            Cursor::Composite(vs) => vs.clone(),
        };
        if values.len() != self.order.len() {
            return Err(OrmError::InvalidPage(format!(
                "cursor holds {} values but the ordering has {} fields",
                values.len(),
                self.order.len()
            )));
        }
        let mut alternatives = Vec::with_capacity(values.len());
        for i in 0..values.len() {
            let mut clauses = Vec::with_capacity(i + 1);
            for j in 0..i {
                clauses.push(Q::expr(self.order[j].1.clone(), values[j].clone()));
            }
            let (descending, name) = &self.order[i];
            let op = if *descending { "lt" } else { "gt" };
            clauses.push(Q::expr(format!("{name}__{op}"), values[i].clone()));
            alternatives.push(and_(clauses));
        }
        Ok(or_(alternatives))
    }

    fn cursor_of(&self, item: &Fetched<M>) -> Cursor {
        let mut values: Vec<Value> = self
            .order
            .iter()
            .map(|(_, name)| item.row().value(name).cloned().unwrap_or(Value::Null))
            .collect();
        if values.len() == 1 {
            Cursor::Single(values.remove(0))
        } else {
            Cursor::Composite(values)
        }
    }

    /// Fetches the page strictly beyond `cursor` (or the first page when
    /// `None`). `backward` pages toward earlier rows by delegating to the
    /// reverse paginator and re-reversing the content for presentation;
    /// `next_cursor` always continues in the direction of travel.
    pub async fn get_page(
        self: &Arc<Self>,
        db: &dyn DbExecutor,
        cursor: Option<&Cursor>,
        backward: bool,
    ) -> OrmResult<CursorPage<M>> {
        if backward {
            let reversed = self.get_reverse_paginator();
            let mut page = Box::pin(reversed.get_page(db, cursor, false)).await?;
            page.items.reverse();
            for item in &mut page.items {
                std::mem::swap(&mut item.previous, &mut item.next);
            }
            return Ok(page);
        }

        debug!(table = M::table_name(), "fetching cursor page");
        let mut queryset = self.queryset.clone();
        if let Some(cursor) = cursor {
            queryset = queryset.filter(self.cursor_filter(cursor)?);
        }
        if self.page_size > 0 {
            queryset = queryset.limit(self.page_size + 1);
        }
        let mut rows = queryset.fetch(db).await?;

        let has_next = self.page_size > 0 && rows.len() > self.page_size;
        let trailing_row = if has_next {
            rows.truncate(self.page_size + 1);
            rows.pop()
        } else {
            None
        };
        let content: Vec<Arc<M>> = rows.iter().map(Fetched::shared).collect();
        let next_cursor = if has_next {
            rows.last().map(|last| self.cursor_of(last))
        } else {
            None
        };
        let trailing = trailing_row.as_ref().map(Fetched::shared);

        Ok(CursorPage {
            items: link_items(&content, None, trailing.as_ref()),
            has_next,
            next_cursor,
        })
    }

    /// Returns a restartable iterator over all cursor pages.
    pub fn paginate(self: &Arc<Self>, backward: bool) -> CursorPageIter<M> {
        CursorPageIter {
            paginator: Arc::clone(self),
            cursor: None,
            backward,
            done: false,
        }
    }
}

/// A lazy cursor-page iterator.
pub struct CursorPageIter<M: Model> {
    paginator: Arc<CursorPaginator<M>>,
    cursor: Option<Cursor>,
    backward: bool,
    done: bool,
}

impl<M: Model> CursorPageIter<M> {
    /// Fetches the next page, or `None` once exhausted.
    pub async fn next(&mut self, db: &dyn DbExecutor) -> OrmResult<Option<CursorPage<M>>> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .paginator
            .get_page(db, self.cursor.as_ref(), self.backward)
            .await?;
        self.done = !page.has_next;
        self.cursor.clone_from(&page.next_cursor);
        Ok(Some(page))
    }

    /// Rewinds to the first page.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.done = false;
    }
}

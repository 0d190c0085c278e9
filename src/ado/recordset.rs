//! `ADODB.Recordset`
//!
//! Two cursor backends sit behind one object:
//!
//! - **Materialized**: the whole result set is buffered. Navigation, Sort,
//!   Filter, Find, paging and GetRows run locally. Edits are written through
//!   to the source table when the recordset came from a wire connection.
//! - **Bridged**: every call goes to an external [`BridgeCursor`]; the current
//!   row is re-read on each stop.
//!
//! After every state change the current row is projected into [`Fields`].
//! Lock order is recordset state, then fields. Field objects call back into
//! [`FieldOwner::assign_field`] without holding their own lock.

use super::bridge::{BridgeCursor, CursorOptions, EditOp, Step};
use super::connection::{Backend, Connection};
use super::criteria::{FilterExpr, SortSpec};
use super::errors::Errors;
use super::fields::{FieldOwner, Fields};
use super::persist::{self, WriteStatement};
use crate::core::dispatch::{arg, has_arg, Dispatch, DispatchError, DispatchResult, Member};
use crate::core::{ArrayRef, ObjectRef, Variant};
use crate::drivers::{ExecOutcome, RowSet, Session};
use crate::error::{Error, Result};
use crate::runtime::context::Scope;
use crate::runtime::resources::ManagedResource;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

const CLASS: &str = "ADODB.Recordset";

/// Wire session plus the error sink for write-through statements
pub(crate) struct WireLink {
    pub session: Session,
    pub errors: Arc<Errors>,
}

struct BufferedRow {
    values: Vec<Variant>,
    original: Vec<Variant>,
    dirty: bool,
}

impl BufferedRow {
    fn new(values: Vec<Variant>) -> Self {
        Self {
            original: values.clone(),
            values,
            dirty: false,
        }
    }
}

struct ActiveFilter {
    text: String,
    expr: Option<FilterExpr>,
    /// Buffer indices visible through the filter, in buffer order
    indices: Vec<usize>,
}

/// Buffered result set. `pos` is a position in the visible view: `-1` is
/// BOF, `view_len()` is EOF.
struct RowBuffer {
    columns: Vec<String>,
    rows: Vec<BufferedRow>,
    pos: i64,
    filter: Option<ActiveFilter>,
    sort: String,
    /// Row being added: lower-cased name to (display name, value)
    staged: Option<IndexMap<String, (String, Variant)>>,
    link: Option<WireLink>,
    table: Option<String>,
    source: String,
}

fn lookup<'r>(columns: &[String], values: &'r [Variant], key: &str) -> Option<&'r Variant> {
    columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(key))
        .and_then(|i| values.get(i))
}

fn field_major(columns: Vec<Vec<Variant>>) -> Variant {
    Variant::Array(ArrayRef::from_values(
        columns
            .into_iter()
            .map(|column| Variant::Array(ArrayRef::from_values(column)))
            .collect(),
    ))
}

impl RowBuffer {
    fn new(rows: RowSet, source: &str, link: Option<WireLink>) -> Self {
        let table = link.as_ref().and_then(|_| persist::extract_table_name(source));
        Self {
            columns: rows.columns,
            rows: rows.rows.into_iter().map(BufferedRow::new).collect(),
            pos: 0,
            filter: None,
            sort: String::new(),
            staged: None,
            link,
            table,
            source: source.to_string(),
        }
    }

    fn view_len(&self) -> i64 {
        match &self.filter {
            Some(filter) => filter.indices.len() as i64,
            None => self.rows.len() as i64,
        }
    }

    fn row_index(&self, pos: i64) -> Option<usize> {
        let pos = usize::try_from(pos).ok()?;
        match &self.filter {
            Some(filter) => filter.indices.get(pos).copied(),
            None => (pos < self.rows.len()).then_some(pos),
        }
    }

    fn current_index(&self) -> Option<usize> {
        self.row_index(self.pos)
    }

    fn is_eof(&self) -> bool {
        let len = self.view_len();
        len == 0 || self.pos >= len
    }

    fn is_bof(&self) -> bool {
        self.view_len() == 0 || self.pos < 0
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        let name = name.trim();
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    fn column_for(&self, key: &Variant) -> Option<usize> {
        match key.resolve_default() {
            Variant::Int(_) | Variant::Float(_) => {
                let index = usize::try_from(key.to_int()).ok()?;
                (index < self.columns.len()).then_some(index)
            }
            other => self.column_index(&other.to_string()),
        }
    }

    fn set_pos(&mut self, pos: i64) {
        self.pos = pos.clamp(-1, self.view_len());
    }

    fn move_next(&mut self) {
        if !self.is_eof() {
            self.pos += 1;
        }
    }

    fn move_previous(&mut self) {
        let len = self.view_len();
        if self.pos >= len {
            self.pos = len - 1;
        } else if self.pos >= 0 {
            self.pos -= 1;
        }
    }

    fn move_first(&mut self) {
        self.pos = 0;
    }

    fn move_last(&mut self) {
        self.pos = self.view_len() - 1;
    }

    /// `Move n [, start]`; start is a 1-based position
    fn move_by(&mut self, count: i64, start: Option<i64>) {
        let base = start.map_or(self.pos, |s| s - 1);
        self.set_pos(base.saturating_add(count));
    }

    fn absolute_page(&self, page_size: i64, stored: i64) -> i64 {
        if page_size <= 0 || self.is_eof() || self.is_bof() {
            return stored;
        }
        self.pos / page_size + 1
    }

    fn page_count(&self, page_size: i64) -> i64 {
        if page_size <= 0 {
            return 0;
        }
        let len = self.view_len();
        len / page_size + i64::from(len % page_size != 0)
    }

    fn goto_page(&mut self, page: i64, page_size: i64) {
        let len = self.view_len();
        let start = page.saturating_sub(1).max(0).saturating_mul(page_size.max(1));
        self.pos = if start >= len { len } else { start };
    }

    fn apply_sort(&mut self, text: &str) {
        self.sort = text.trim().to_string();
        let spec = SortSpec::parse(text);
        if !spec.is_empty() {
            let columns = &self.columns;
            self.rows.sort_by(|a, b| {
                spec.compare(
                    |k| lookup(columns, &a.values, k),
                    |k| lookup(columns, &b.values, k),
                )
            });
            self.refilter();
        }
        self.pos = 0;
    }

    fn apply_filter(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            self.filter = None;
        } else {
            self.filter = Some(ActiveFilter {
                text: text.to_string(),
                expr: FilterExpr::parse(text),
                indices: Vec::new(),
            });
            self.refilter();
        }
        self.pos = 0;
    }

    fn refilter(&mut self) {
        let Some(filter) = &self.filter else {
            return;
        };
        let indices = match &filter.expr {
            Some(expr) => (0..self.rows.len())
                .filter(|&i| expr.matches(|k| lookup(&self.columns, &self.rows[i].values, k)))
                .collect(),
            None => Vec::new(),
        };
        if let Some(filter) = &mut self.filter {
            filter.indices = indices;
        }
    }

    fn filter_text(&self) -> &str {
        self.filter.as_ref().map_or("", |f| f.text.as_str())
    }

    fn matches_at(&self, expr: &FilterExpr, pos: i64) -> bool {
        self.row_index(pos)
            .is_some_and(|i| expr.matches(|k| lookup(&self.columns, &self.rows[i].values, k)))
    }

    /// Scans from the row after the current one; a miss parks on EOF (BOF
    /// when scanning backward). Malformed criteria leave the cursor alone.
    fn find(&mut self, criteria: &str, skip: i64, backward: bool) {
        let Some(expr) = FilterExpr::parse(criteria) else {
            return;
        };
        let len = self.view_len();
        if backward {
            let mut pos = self.pos.min(len) - 1 - skip;
            while pos >= 0 {
                if self.matches_at(&expr, pos) {
                    self.pos = pos;
                    return;
                }
                pos -= 1;
            }
            self.pos = -1;
        } else {
            let mut pos = self.pos.max(-1) + 1 + skip;
            while pos < len {
                if self.matches_at(&expr, pos) {
                    self.pos = pos;
                    return;
                }
                pos += 1;
            }
            self.pos = len;
        }
    }

    /// Field-major array of up to `count` rows from the current position;
    /// leaves the cursor after the last row read
    fn get_rows(&mut self, count: Option<i64>, fields: Option<Vec<Variant>>) -> Variant {
        let len = self.view_len();
        if len == 0 {
            return Variant::Array(ArrayRef::from_values(Vec::new()));
        }
        if self.pos >= len || self.pos < 0 {
            self.pos = 0;
        }
        let start = self.pos;
        let end = match count {
            Some(n) if n >= 0 => start.saturating_add(n).min(len),
            _ => len,
        };
        let selected: Vec<usize> = match fields {
            Some(keys) => keys.iter().filter_map(|k| self.column_for(k)).collect(),
            None => (0..self.columns.len()).collect(),
        };
        let columns = selected
            .iter()
            .map(|&c| {
                (start..end)
                    .filter_map(|p| self.row_index(p))
                    .map(|i| self.rows[i].values.get(c).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        self.pos = end;
        field_major(columns)
    }

    fn edit_mode(&self) -> i64 {
        if self.staged.is_some() {
            2
        } else if self.current_index().is_some_and(|i| self.rows[i].dirty) {
            1
        } else {
            0
        }
    }

    /// Names and values shown through `Fields`
    fn projection(&self) -> (Vec<String>, Vec<Variant>) {
        if let Some(staged) = &self.staged {
            let mut columns = self.columns.clone();
            for (key, (name, _)) in staged {
                if self.column_index(key).is_none() {
                    columns.push(name.clone());
                }
            }
            let values = columns
                .iter()
                .map(|c| {
                    staged
                        .get(&c.to_ascii_lowercase())
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default()
                })
                .collect();
            return (columns, values);
        }
        match self.current_index() {
            Some(i) => (self.columns.clone(), self.rows[i].values.clone()),
            None => (self.columns.clone(), Vec::new()),
        }
    }

    /// Stores a value into the staged row or the current row's column
    fn assign(&mut self, name: &str, value: Variant) -> bool {
        let name = name.trim();
        if let Some(staged) = &mut self.staged {
            staged.insert(name.to_ascii_lowercase(), (name.to_string(), value));
            return true;
        }
        let (Some(row), Some(col)) = (self.current_index(), self.column_index(name)) else {
            return false;
        };
        let row = &mut self.rows[row];
        row.values[col] = value;
        row.dirty = true;
        true
    }

    fn add_new(&mut self, pairs: Vec<(String, Variant)>) {
        if self.staged.is_some() {
            self.update();
        }
        let mut staged = IndexMap::new();
        for (name, value) in pairs {
            let name = name.trim().to_string();
            staged.insert(name.to_ascii_lowercase(), (name, value));
        }
        self.staged = Some(staged);
    }

    fn update(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.commit_staged(staged);
            return;
        }
        let Some(index) = self.current_index() else {
            return;
        };
        if !self.rows[index].dirty {
            return;
        }
        let row = &self.rows[index];
        let statement = self
            .writable_table()
            .and_then(|table| persist::update(table, &self.source, &self.columns, &row.values, &row.original));
        self.write(statement);

        let row = &mut self.rows[index];
        row.original = row.values.clone();
        row.dirty = false;
    }

    fn commit_staged(&mut self, staged: IndexMap<String, (String, Variant)>) {
        for (name, _) in staged.values() {
            if self.column_index(name).is_none() {
                self.columns.push(name.clone());
                for row in &mut self.rows {
                    row.values.push(Variant::Empty);
                    row.original.push(Variant::Empty);
                }
            }
        }
        let mut values: Vec<Variant> = self
            .columns
            .iter()
            .map(|c| {
                staged
                    .get(&c.to_ascii_lowercase())
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            })
            .collect();

        let pairs: Vec<(String, Variant)> = staged.into_values().collect();
        let statement = self.writable_table().and_then(|table| persist::insert(table, &pairs));
        if let Some(outcome) = self.write(statement) {
            if let Some(id) = persist::identity_column(&self.columns) {
                if outcome.last_insert_id > 0 && values[id].is_nothing() {
                    values[id] = Variant::Int(outcome.last_insert_id);
                }
            }
        }

        self.rows.push(BufferedRow::new(values));
        let index = self.rows.len() - 1;
        match &mut self.filter {
            Some(filter) => {
                filter.indices.push(index);
                self.pos = filter.indices.len() as i64 - 1;
            }
            None => self.pos = index as i64,
        }
    }

    fn delete(&mut self) {
        let Some(index) = self.current_index() else {
            return;
        };
        let statement = self.writable_table().and_then(|table| {
            persist::delete(table, &self.source, &self.columns, &self.rows[index].original)
        });
        self.write(statement);

        self.rows.remove(index);
        if let Some(filter) = &mut self.filter {
            filter.indices.retain(|&i| i != index);
            for i in filter.indices.iter_mut() {
                if *i > index {
                    *i -= 1;
                }
            }
        }
        let len = self.view_len();
        if self.pos >= len {
            self.pos = len - 1;
        }
    }

    fn cancel_update(&mut self) {
        self.staged = None;
        if let Some(index) = self.current_index() {
            let row = &mut self.rows[index];
            if row.dirty {
                row.values = row.original.clone();
                row.dirty = false;
            }
        }
    }

    fn writable_table(&self) -> Option<&str> {
        self.link.as_ref()?;
        self.table.as_deref()
    }

    /// Runs a write-through statement; failures go to the connection's
    /// Errors and the in-memory change stands
    fn write(&self, statement: Option<WriteStatement>) -> Option<ExecOutcome> {
        let link = self.link.as_ref()?;
        let statement = statement?;
        debug!(sql = %statement.sql, "recordset write-through");
        match link.session.exec(&statement.sql, &statement.params) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                link.errors.push(&err);
                None
            }
        }
    }
}

struct BridgedCursor {
    cursor: Box<dyn BridgeCursor>,
    columns: Vec<String>,
}

impl BridgedCursor {
    fn new(mut cursor: Box<dyn BridgeCursor>) -> Result<Self> {
        let columns = cursor.columns()?;
        Ok(Self { cursor, columns })
    }

    fn at_row(&mut self) -> Result<bool> {
        Ok(!self.cursor.eof()? && !self.cursor.bof()?)
    }

    fn row_values(&mut self) -> Result<Vec<Variant>> {
        (0..self.columns.len()).map(|i| self.cursor.value(i)).collect()
    }

    fn projection(&mut self) -> Result<(Vec<String>, Vec<Variant>)> {
        let values = if self.at_row()? {
            self.row_values()?
        } else {
            Vec::new()
        };
        Ok((self.columns.clone(), values))
    }

    fn step(&mut self, count: i64) -> Result<()> {
        let step = if count < 0 { Step::Previous } else { Step::Next };
        for _ in 0..count.unsigned_abs() {
            if (step == Step::Next && self.cursor.eof()?) || (step == Step::Previous && self.cursor.bof()?) {
                break;
            }
            self.cursor.move_to(step)?;
        }
        Ok(())
    }

    fn find(&mut self, criteria: &str, backward: bool) -> Result<()> {
        let Some(expr) = FilterExpr::parse(criteria) else {
            return Ok(());
        };
        let step = if backward { Step::Previous } else { Step::Next };
        loop {
            if (backward && self.cursor.bof()?) || (!backward && self.cursor.eof()?) {
                return Ok(());
            }
            self.cursor.move_to(step)?;
            if !self.at_row()? {
                return Ok(());
            }
            let values = self.row_values()?;
            if expr.matches(|k| lookup(&self.columns, &values, k)) {
                return Ok(());
            }
        }
    }

    fn get_rows(&mut self, count: Option<i64>) -> Result<Variant> {
        if self.cursor.eof()? {
            self.cursor.move_to(Step::First)?;
        }
        if self.cursor.bof()? && !self.cursor.eof()? {
            self.cursor.move_to(Step::Next)?;
        }
        let mut columns = vec![Vec::new(); self.columns.len()];
        let mut taken = 0;
        while !self.cursor.eof()? && count.map_or(true, |n| taken < n) {
            for (i, column) in columns.iter_mut().enumerate() {
                column.push(self.cursor.value(i)?);
            }
            taken += 1;
            self.cursor.move_to(Step::Next)?;
        }
        Ok(field_major(columns))
    }
}

enum Cursor {
    Closed,
    Materialized(RowBuffer),
    Bridged(BridgedCursor),
}

struct RecordsetState {
    cursor: Cursor,
    source: String,
    connection: Weak<Connection>,
    /// Connection opened from a descriptor passed to `Open`
    owned_connection: Option<Arc<Connection>>,
    options: CursorOptions,
    page_size: i64,
    absolute_page: i64,
}

/// ADO `Supports` option values this runtime reports as available
fn supports(option: i64) -> bool {
    match option {
        // adBookmark, adResync, adUpdateBatch
        0x2000 | 0x0002_0000 | 0x0001_0000 => false,
        // adAddNew, adDelete, adUpdate, adMovePrevious, adFind, adApproxPosition,
        // adHoldRecords and anything unlisted
        _ => true,
    }
}

pub struct Recordset {
    me: Weak<Recordset>,
    scope: Scope,
    fields: Arc<Fields>,
    state: Mutex<RecordsetState>,
}

impl Recordset {
    /// A closed recordset registered with the request
    pub fn new(scope: &Scope) -> Arc<Self> {
        Self::build(scope, Cursor::Closed, "", Weak::new())
    }

    fn build(scope: &Scope, cursor: Cursor, source: &str, connection: Weak<Connection>) -> Arc<Self> {
        let rs = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scope: scope.clone(),
            fields: Arc::new(Fields::new()),
            state: Mutex::new(RecordsetState {
                cursor,
                source: source.to_string(),
                connection,
                owned_connection: None,
                options: CursorOptions::default(),
                page_size: scope.config().default_page_size,
                absolute_page: 1,
            }),
        });
        scope.register(rs.clone());
        {
            let mut state = rs.state.lock();
            if let Err(err) = rs.refresh(&mut state) {
                debug!(error = %err, "initial projection failed");
            }
        }
        rs
    }

    pub(crate) fn materialized(
        scope: &Scope,
        rows: RowSet,
        source: &str,
        link: Option<WireLink>,
        connection: Weak<Connection>,
    ) -> Arc<Self> {
        let buffer = RowBuffer::new(rows, source, link);
        Self::build(scope, Cursor::Materialized(buffer), source, connection)
    }

    pub(crate) fn bridged(
        scope: &Scope,
        cursor: Box<dyn BridgeCursor>,
        source: &str,
        connection: Weak<Connection>,
    ) -> Result<Arc<Self>> {
        let cursor = BridgedCursor::new(cursor)?;
        Ok(Self::build(scope, Cursor::Bridged(cursor), source, connection))
    }

    pub fn fields(&self) -> &Arc<Fields> {
        &self.fields
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state.lock().cursor, Cursor::Closed)
    }

    pub fn eof(&self) -> bool {
        self.get_property(&Member::new("eof")).to_bool()
    }

    pub fn bof(&self) -> bool {
        self.get_property(&Member::new("bof")).to_bool()
    }

    pub fn record_count(&self) -> i64 {
        self.get_property(&Member::new("recordcount")).to_int()
    }

    fn refresh(&self, state: &mut RecordsetState) -> Result<()> {
        let (columns, values) = match &mut state.cursor {
            Cursor::Closed => {
                self.fields.clear();
                return Ok(());
            }
            Cursor::Materialized(buffer) => buffer.projection(),
            Cursor::Bridged(bridged) => bridged.projection()?,
        };
        let owner: Weak<dyn FieldOwner> = self.me.clone();
        self.fields.project(&columns, values, owner);
        Ok(())
    }

    /// Runs `f` against the materialized buffer and re-projects; closed and
    /// bridged cursors are left alone
    fn with_buffer<R: Default>(&self, f: impl FnOnce(&mut RowBuffer) -> R) -> R {
        let mut state = self.state.lock();
        let Cursor::Materialized(buffer) = &mut state.cursor else {
            return R::default();
        };
        let result = f(buffer);
        if let Err(err) = self.refresh(&mut state) {
            debug!(error = %err, "projection failed");
        }
        result
    }

    /// Runs `f` against the bridged cursor and re-projects; provider faults
    /// surface as dispatch errors
    fn with_bridge<R: Default>(
        &self,
        member: &Member,
        f: impl FnOnce(&mut BridgedCursor) -> Result<R>,
    ) -> DispatchResult<R> {
        let mut state = self.state.lock();
        let Cursor::Bridged(bridged) = &mut state.cursor else {
            return Ok(R::default());
        };
        let result = f(bridged).map_err(|err| fault(member, err))?;
        self.refresh(&mut state).map_err(|err| fault(member, err))?;
        Ok(result)
    }

    fn is_bridged(&self) -> bool {
        matches!(self.state.lock().cursor, Cursor::Bridged(_))
    }

    /// `Open Source, [ActiveConnection], [CursorType], [LockType]`
    pub fn open(&self, args: &[Variant]) -> Result<()> {
        let mut state = self.state.lock();
        if has_arg(args, 1) {
            self.bind_connection(&mut state, &args[1])?;
        }
        if has_arg(args, 2) {
            state.options.cursor_type = arg(args, 2).to_int();
        }
        if has_arg(args, 3) {
            state.options.lock_type = arg(args, 3).to_int();
        }
        let source = match arg(args, 0).to_string() {
            s if s.trim().is_empty() => state.source.clone(),
            s => s,
        };
        if source.trim().is_empty() {
            return Err(Error::Execution("recordset source is empty".to_string()));
        }
        close_cursor(&mut state.cursor);

        let conn = state.connection.upgrade().ok_or(Error::Closed("connection"))?;
        state.cursor = match conn.backend().ok_or(Error::Closed("connection"))? {
            Backend::Wire(session) => {
                let rows = session.query(&source, &[])?;
                let link = WireLink {
                    session,
                    errors: conn.errors().clone(),
                };
                Cursor::Materialized(RowBuffer::new(rows, &source, Some(link)))
            }
            Backend::Bridge(session) => {
                let cursor = session.open_cursor(&source, state.options)?;
                Cursor::Bridged(BridgedCursor::new(cursor)?)
            }
        };
        state.source = source;
        state.absolute_page = 1;
        self.refresh(&mut state)
    }

    fn bind_connection(&self, state: &mut RecordsetState, value: &Variant) -> Result<()> {
        match value {
            Variant::Object(obj) => {
                if let Some(conn) = obj.downcast::<Connection>() {
                    state.connection = Arc::downgrade(&conn);
                    state.owned_connection = None;
                }
                Ok(())
            }
            Variant::String(descriptor) if !descriptor.trim().is_empty() => {
                let conn = Connection::new(&self.scope);
                state.connection = Arc::downgrade(&conn);
                state.owned_connection = Some(conn.clone());
                conn.open(descriptor)
            }
            _ => Ok(()),
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        close_cursor(&mut state.cursor);
        if let Some(conn) = state.owned_connection.take() {
            conn.close();
        }
        self.fields.clear();
    }

    /// Failures land on the bound connection's Errors
    fn report(&self, err: &Error) {
        let conn = self.state.lock().connection.upgrade();
        match conn {
            Some(conn) => conn.errors().push(err),
            None => debug!(error = %err, "recordset error with no connection"),
        }
    }

    fn requery(&self) -> Result<()> {
        let source = self.state.lock().source.clone();
        self.open(&[Variant::from(source)])
    }

    fn property(&self, name: &str) -> Variant {
        let mut state = self.state.lock();
        let page_size = state.page_size;
        let stored_page = state.absolute_page;
        match &mut state.cursor {
            Cursor::Closed => match name {
                "eof" | "bof" => Variant::Bool(true),
                "recordcount" | "pagecount" | "absoluteposition" | "editmode" => Variant::Int(0),
                "absolutepage" => Variant::Int(stored_page),
                "sort" | "filter" => Variant::from(""),
                _ => Variant::Empty,
            },
            Cursor::Materialized(buffer) => match name {
                "eof" => Variant::Bool(buffer.is_eof()),
                "bof" => Variant::Bool(buffer.is_bof()),
                "recordcount" => Variant::Int(buffer.view_len()),
                "absoluteposition" => {
                    Variant::Int(buffer.current_index().map_or(0, |_| buffer.pos + 1))
                }
                "absolutepage" => Variant::Int(buffer.absolute_page(page_size, stored_page)),
                "pagecount" => Variant::Int(buffer.page_count(page_size)),
                "sort" => Variant::from(buffer.sort.as_str()),
                "filter" => Variant::from(buffer.filter_text()),
                "editmode" => Variant::Int(buffer.edit_mode()),
                _ => Variant::Empty,
            },
            Cursor::Bridged(bridged) => {
                let result = match name {
                    "eof" => bridged.cursor.eof().map(Variant::Bool),
                    "bof" => bridged.cursor.bof().map(Variant::Bool),
                    "recordcount" => bridged.cursor.record_count().map(Variant::Int),
                    other => bridged.cursor.property(other),
                };
                result.unwrap_or_else(|err| {
                    debug!(property = name, error = %err, "bridge property read failed");
                    Variant::Empty
                })
            }
        }
    }

    fn set_cursor_property(&self, name: &Member, value: Variant) -> DispatchResult<()> {
        let text = value.to_string();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let page_size = state.page_size;
        match &mut state.cursor {
            Cursor::Closed => {
                if name.as_str() == "absolutepage" {
                    state.absolute_page = value.to_int().max(1);
                }
                return Ok(());
            }
            Cursor::Materialized(buffer) => match name.as_str() {
                "sort" => buffer.apply_sort(&text),
                "filter" => {
                    let clears = value.is_nothing() || (value.is_numeric() && value.to_int() == 0);
                    buffer.apply_filter(if clears { "" } else { &text });
                }
                "absoluteposition" => {
                    let position = value.to_int();
                    if position > 0 {
                        buffer.set_pos(position - 1);
                    }
                }
                "absolutepage" => {
                    let page = value.to_int();
                    if page > 0 {
                        buffer.goto_page(page, page_size);
                        state.absolute_page = page;
                    }
                }
                _ => {}
            },
            Cursor::Bridged(bridged) => {
                bridged
                    .cursor
                    .set_property(name.as_str(), value)
                    .map_err(|err| fault(name, err))?;
            }
        }
        self.refresh(state).map_err(|err| fault(name, err))
    }

    fn assign(&self, name: &str, value: Variant) -> DispatchResult<()> {
        let member = Member::new(name);
        if self.is_bridged() {
            return self.with_bridge(&member, |b| b.cursor.set_value(name, value));
        }
        self.with_buffer(|buffer| buffer.assign(name, value));
        Ok(())
    }

    fn call_navigation(&self, member: &Member, args: &[Variant]) -> DispatchResult<()> {
        if self.is_bridged() {
            let step = match member.as_str() {
                "movefirst" => Some(Step::First),
                "movelast" => Some(Step::Last),
                "movenext" => Some(Step::Next),
                "moveprevious" => Some(Step::Previous),
                _ => None,
            };
            return self.with_bridge(member, |b| match step {
                Some(step) => b.cursor.move_to(step),
                None => b.step(arg(args, 0).to_int()),
            });
        }
        self.with_buffer(|buffer| match member.as_str() {
            "movefirst" => buffer.move_first(),
            "movelast" => buffer.move_last(),
            "movenext" => buffer.move_next(),
            "moveprevious" => buffer.move_previous(),
            _ => {
                let start = has_arg(args, 1).then(|| arg(args, 1).to_int());
                buffer.move_by(arg(args, 0).to_int(), start);
            }
        });
        Ok(())
    }

    fn call_edit(&self, member: &Member, args: &[Variant]) -> DispatchResult<()> {
        let assignments = paired_assignments(args);
        if self.is_bridged() {
            return self.with_bridge(member, |b| match member.as_str() {
                "addnew" => {
                    b.cursor.edit(EditOp::AddNew)?;
                    for (name, value) in assignments {
                        b.cursor.set_value(&name, value)?;
                    }
                    Ok(())
                }
                "update" => {
                    for (name, value) in assignments {
                        b.cursor.set_value(&name, value)?;
                    }
                    b.cursor.edit(EditOp::Update)
                }
                "delete" => b.cursor.edit(EditOp::Delete),
                _ => b.cursor.edit(EditOp::CancelUpdate),
            });
        }
        self.with_buffer(|buffer| match member.as_str() {
            "addnew" => buffer.add_new(assignments),
            "update" => {
                for (name, value) in assignments {
                    buffer.assign(&name, value);
                }
                buffer.update();
            }
            "delete" => buffer.delete(),
            _ => buffer.cancel_update(),
        });
        Ok(())
    }

    fn get_rows(&self, member: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        let count = has_arg(args, 0).then(|| arg(args, 0).to_int()).filter(|&n| n >= 0);
        if self.is_bridged() {
            return self.with_bridge(member, |b| b.get_rows(count));
        }
        let fields = match arg(args, 2) {
            Variant::Array(keys) => Some(keys.to_vec()),
            Variant::Empty => None,
            key => Some(vec![key]),
        };
        let rows = self.with_buffer(|buffer| Some(buffer.get_rows(count, fields)));
        Ok(rows.unwrap_or_else(|| Variant::Array(ArrayRef::from_values(Vec::new()))))
    }

    /// `Find Criteria, [SkipRows], [SearchDirection]`
    fn find(&self, member: &Member, args: &[Variant]) -> DispatchResult<()> {
        let criteria = arg(args, 0).to_string();
        let backward = arg(args, 2).to_int() < 0;
        if self.is_bridged() {
            return self.with_bridge(member, |b| b.find(&criteria, backward));
        }
        let skip = arg(args, 1).to_int().max(0);
        self.with_buffer(|buffer| buffer.find(&criteria, skip, backward));
        Ok(())
    }
}

fn close_cursor(cursor: &mut Cursor) {
    if let Cursor::Bridged(mut bridged) = std::mem::replace(cursor, Cursor::Closed) {
        if let Err(err) = bridged.cursor.close() {
            debug!(error = %err, "bridge cursor close failed");
        }
    }
}

fn fault(member: &Member, err: Error) -> DispatchError {
    DispatchError::new(CLASS, member, err.to_string())
}

/// `(field, value)` or `(Array(fields), Array(values))` argument pairs
fn paired_assignments(args: &[Variant]) -> Vec<(String, Variant)> {
    match (arg(args, 0), arg(args, 1)) {
        (Variant::Array(names), Variant::Array(values)) => names
            .to_vec()
            .into_iter()
            .map(|n| n.to_string())
            .zip(values.to_vec())
            .collect(),
        (Variant::Empty, _) => Vec::new(),
        (name, value) => vec![(name.to_string(), value)],
    }
}

impl FieldOwner for Recordset {
    fn assign_field(&self, name: &str, value: Variant) -> DispatchResult<()> {
        self.assign(name, value)
    }
}

impl Dispatch for Recordset {
    fn class_name(&self) -> &'static str {
        CLASS
    }

    fn get_property(&self, name: &Member) -> Variant {
        match name.as_str() {
            "fields" => Variant::Object(ObjectRef::new(self.fields.clone())),
            "state" => Variant::Int(i64::from(self.is_open())),
            "source" => Variant::from(self.state.lock().source.as_str()),
            "pagesize" => Variant::Int(self.state.lock().page_size),
            "cursortype" => Variant::Int(self.state.lock().options.cursor_type),
            "locktype" => Variant::Int(self.state.lock().options.lock_type),
            "cursorlocation" => Variant::Int(self.state.lock().options.cursor_location),
            "activeconnection" => self
                .state
                .lock()
                .connection
                .upgrade()
                .map(|c| Variant::Object(ObjectRef::new(c)))
                .unwrap_or_default(),
            "getrows" => self.get_rows(name, &[]).unwrap_or_default(),
            "eof" | "bof" | "recordcount" | "absoluteposition" | "absolutepage" | "pagecount"
            | "sort" | "filter" | "editmode" => self.property(name.as_str()),
            _ => Variant::Empty,
        }
    }

    fn set_property(&self, name: &Member, value: Variant) -> DispatchResult<()> {
        match name.as_str() {
            "activeconnection" => {
                let result = {
                    let mut state = self.state.lock();
                    self.bind_connection(&mut state, &value)
                };
                if let Err(err) = result {
                    self.report(&err);
                }
                Ok(())
            }
            "source" => {
                self.state.lock().source = value.to_string();
                Ok(())
            }
            "cursortype" => {
                self.state.lock().options.cursor_type = value.to_int();
                Ok(())
            }
            "locktype" => {
                self.state.lock().options.lock_type = value.to_int();
                Ok(())
            }
            "cursorlocation" => {
                self.state.lock().options.cursor_location = value.to_int();
                Ok(())
            }
            "pagesize" => {
                let size = value.to_int();
                if size > 0 {
                    let mut state = self.state.lock();
                    state.page_size = size;
                    if let Cursor::Bridged(bridged) = &mut state.cursor {
                        bridged
                            .cursor
                            .set_property("pagesize", Variant::Int(size))
                            .map_err(|err| fault(name, err))?;
                    }
                }
                Ok(())
            }
            "sort" | "filter" | "absoluteposition" | "absolutepage" => {
                self.set_cursor_property(name, value)
            }
            // rs("field") = value
            field => self.assign(field, value),
        }
    }

    fn call_method(&self, name: &Member, args: &[Variant]) -> DispatchResult<Variant> {
        match name.as_str() {
            "" | "item" | "collect" => Ok(if has_arg(args, 0) {
                self.fields.value_of(&args[0])
            } else {
                Variant::Object(ObjectRef::new(self.fields.clone()))
            }),
            "fields" => Ok(if has_arg(args, 0) {
                self.fields
                    .item(&args[0])
                    .map(|f| Variant::Object(ObjectRef::new(f)))
                    .unwrap_or_default()
            } else {
                Variant::Object(ObjectRef::new(self.fields.clone()))
            }),
            "open" => {
                if let Err(err) = self.open(args) {
                    self.report(&err);
                }
                Ok(Variant::Empty)
            }
            "requery" => {
                if let Err(err) = self.requery() {
                    self.report(&err);
                }
                Ok(Variant::Empty)
            }
            "close" => {
                self.close();
                Ok(Variant::Empty)
            }
            "movefirst" | "movelast" | "movenext" | "moveprevious" | "move" => {
                self.call_navigation(name, args)?;
                Ok(Variant::Empty)
            }
            "addnew" | "update" | "delete" | "cancelupdate" => {
                self.call_edit(name, args)?;
                Ok(Variant::Empty)
            }
            "getrows" => self.get_rows(name, args),
            "find" => {
                self.find(name, args)?;
                Ok(Variant::Empty)
            }
            "supports" => Ok(Variant::Bool(
                has_arg(args, 0) && supports(arg(args, 0).to_int()),
            )),
            _ => Ok(self.get_property(name)),
        }
    }

    fn enumerate(&self) -> Option<Vec<Variant>> {
        self.fields.enumerate()
    }
}

impl ManagedResource for Recordset {
    fn cleanup(&self) {
        self.close();
    }

    fn resource_kind(&self) -> &'static str {
        "recordset"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(columns: &[&str], rows: Vec<Vec<Variant>>) -> RowBuffer {
        RowBuffer::new(
            RowSet {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
            "SELECT * FROM people",
            None,
        )
    }

    fn people() -> RowBuffer {
        buffer(
            &["name", "age"],
            vec![
                vec!["Bob".into(), 25.into()],
                vec!["Alice".into(), 10.into()],
                vec!["Carol".into(), 40.into()],
                vec!["Dave".into(), 33.into()],
                vec!["Erin".into(), 18.into()],
            ],
        )
    }

    fn current(buf: &RowBuffer, column: &str) -> Variant {
        let (columns, values) = buf.projection();
        lookup(&columns, &values, column).cloned().unwrap_or_default()
    }

    #[test]
    fn test_empty_buffer_is_eof_and_bof() {
        let buf = buffer(&["a"], vec![]);
        assert!(buf.is_eof());
        assert!(buf.is_bof());
        assert_eq!(buf.view_len(), 0);
    }

    #[test]
    fn test_navigation_bounds() {
        let mut buf = people();
        assert!(!buf.is_bof());
        for _ in 0..5 {
            assert!(!buf.is_eof());
            buf.move_next();
        }
        assert!(buf.is_eof());
        buf.move_next();
        assert_eq!(buf.pos, 5);

        buf.move_previous();
        assert_eq!(current(&buf, "name"), Variant::from("Erin"));
        buf.move_first();
        buf.move_previous();
        assert!(buf.is_bof());
        buf.move_previous();
        assert_eq!(buf.pos, -1);

        buf.move_by(10, None);
        assert!(buf.is_eof());
        buf.move_by(-2, Some(2));
        assert!(buf.is_bof());
        buf.move_by(2, Some(1));
        assert_eq!(current(&buf, "name"), Variant::from("Carol"));
    }

    #[test]
    fn test_sort_desc_and_filter_after_sort() {
        let mut buf = people();
        buf.apply_sort("age DESC");
        let ages: Vec<i64> = (0..5)
            .map(|p| buf.rows[buf.row_index(p).unwrap()].values[1].to_int())
            .collect();
        assert_eq!(ages, vec![40, 33, 25, 18, 10]);

        buf.apply_filter("age > 20");
        assert_eq!(buf.view_len(), 3);
        assert_eq!(current(&buf, "name"), Variant::from("Carol"));

        buf.apply_filter("");
        assert_eq!(buf.view_len(), 5);
        assert_eq!(buf.pos, 0);
    }

    #[test]
    fn test_malformed_filter_is_empty_view() {
        let mut buf = people();
        buf.apply_filter("age");
        assert_eq!(buf.view_len(), 0);
        assert!(buf.is_eof());
        assert_eq!(buf.filter_text(), "age");
    }

    #[test]
    fn test_paging() {
        let mut buf = people();
        assert_eq!(buf.page_count(2), 3);
        buf.goto_page(2, 2);
        assert_eq!(buf.pos, 2);
        assert_eq!(buf.absolute_page(2, 1), 2);
        buf.goto_page(9, 2);
        assert!(buf.is_eof());
        assert_eq!(buf.absolute_page(2, 9), 9);
    }

    #[test]
    fn test_paging_with_huge_page_size() {
        let mut buf = people();
        assert_eq!(buf.page_count(i64::MAX), 1);
        buf.goto_page(i64::MAX, i64::MAX);
        assert!(buf.is_eof());
        buf.goto_page(1, i64::MAX);
        assert_eq!(buf.pos, 0);
        assert_eq!(buf.absolute_page(i64::MAX, 1), 1);
    }

    #[test]
    fn test_find_forward_and_backward() {
        let mut buf = people();
        buf.find("name = 'Dave'", 0, false);
        assert_eq!(buf.pos, 3);
        buf.find("age < 20", 0, true);
        assert_eq!(current(&buf, "name"), Variant::from("Alice"));
        buf.find("name = 'Zed'", 0, false);
        assert!(buf.is_eof());
        buf.move_first();
        buf.find("bogus", 0, false);
        assert_eq!(buf.pos, 0);
    }

    #[test]
    fn test_get_rows_is_field_major() {
        let mut buf = people();
        buf.move_next();
        let Variant::Array(rows) = buf.get_rows(Some(2), None) else {
            panic!("expected array");
        };
        assert_eq!(rows.len(), 2);
        let Some(Variant::Array(names)) = rows.get(0) else {
            panic!("expected column array");
        };
        assert_eq!(names.to_vec(), vec![Variant::from("Alice"), Variant::from("Carol")]);
        assert_eq!(buf.pos, 3);

        let Variant::Array(ages) = buf.get_rows(None, Some(vec!["AGE".into()])) else {
            panic!("expected array");
        };
        assert_eq!(ages.len(), 1);
        assert!(buf.is_eof());
    }

    #[test]
    fn test_add_new_update_and_cancel() {
        let mut buf = people();
        buf.add_new(vec![("name".into(), "Frank".into())]);
        assert_eq!(buf.edit_mode(), 2);
        assert!(buf.assign("Age", 51.into()));
        assert_eq!(current(&buf, "age"), Variant::Int(51));
        buf.update();
        assert_eq!(buf.rows.len(), 6);
        assert_eq!(buf.pos, 5);
        assert_eq!(current(&buf, "name"), Variant::from("Frank"));

        buf.move_first();
        buf.assign("name", "Robert".into());
        assert_eq!(buf.edit_mode(), 1);
        buf.cancel_update();
        assert_eq!(current(&buf, "name"), Variant::from("Bob"));
        assert_eq!(buf.edit_mode(), 0);
    }

    #[test]
    fn test_add_new_with_new_column() {
        let mut buf = people();
        buf.add_new(vec![("city".into(), "Oslo".into())]);
        buf.update();
        assert_eq!(buf.columns, vec!["name", "age", "city"]);
        assert!(buf.rows.iter().all(|r| r.values.len() == 3));
    }

    #[test]
    fn test_delete_under_filter() {
        let mut buf = people();
        buf.apply_filter("age > 20");
        buf.move_last();
        buf.delete();
        assert_eq!(buf.view_len(), 2);
        assert_eq!(buf.rows.len(), 4);
        assert_eq!(current(&buf, "name"), Variant::from("Carol"));
    }

    #[test]
    fn test_supports_table() {
        assert!(supports(0x0100_0400));
        assert!(supports(0x100));
        assert!(!supports(0x2000));
        assert!(!supports(0x0002_0000));
        assert!(supports(7));
    }
}

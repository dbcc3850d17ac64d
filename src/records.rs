use crate::error::ExtractError;
use chrono::{Days, NaiveDate, TimeZone};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, ErrorCode, OpenFlags, Row, Rows, Statement, params_from_iter};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CAPTURE_QUERY: &str = "SELECT WindowTitle, TimeStamp, ImageToken FROM WindowCapture";

/// One row of the capture table. NULL columns come through as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRecord {
    pub window_title: Option<String>,
    /// Stored by Recall as epoch milliseconds; passed through untouched.
    pub timestamp: Option<i64>,
    pub image_token: Option<String>,
}

impl CaptureRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            window_title: text_column(row, 0)?,
            timestamp: integer_column(row, 1)?,
            image_token: text_column(row, 2)?,
        })
    }
}

// Columns are read leniently, the way SQLite's own text/int accessors coerce.
fn text_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
    })
}

fn integer_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i),
        ValueRef::Real(f) => Some(f as i64),
        ValueRef::Text(t) => std::str::from_utf8(t).ok().and_then(|s| s.trim().parse().ok()),
        ValueRef::Blob(_) => None,
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    BadDate(String),
    #[error("start date {from} is after end date {to}")]
    EmptyRange { from: NaiveDate, to: NaiveDate },
}

/// Narrows which records are listed. Never affects what gets copied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Inclusive lower bound on `TimeStamp`, epoch milliseconds.
    pub from_ms: Option<i64>,
    /// Inclusive upper bound on `TimeStamp`, epoch milliseconds.
    pub to_ms: Option<i64>,
    /// Substring that `WindowTitle` must contain.
    pub search: Option<String>,
}

impl RecordFilter {
    /// Build a filter from the raw `--from`, `--to`, `--search` arguments.
    ///
    /// Dates are whole days in `tz`; `to` covers its entire day.
    pub fn from_args<Tz: TimeZone>(
        from: Option<&str>,
        to: Option<&str>,
        search: Option<&str>,
        tz: &Tz,
    ) -> Result<Self, FilterError> {
        let from_date = from.map(parse_date).transpose()?;
        let to_date = to.map(parse_date).transpose()?;
        if let (Some(from), Some(to)) = (from_date, to_date)
            && from > to
        {
            return Err(FilterError::EmptyRange { from, to });
        }

        Ok(Self {
            from_ms: from_date.map(|d| start_of_day_ms(d, tz)),
            to_ms: to_date.map(|d| {
                d.checked_add_days(Days::new(1))
                    .map(|next| start_of_day_ms(next, tz) - 1)
                    .unwrap_or(i64::MAX)
            }),
            search: search.filter(|s| !s.is_empty()).map(str::to_string),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.from_ms.is_none() && self.to_ms.is_none() && self.search.is_none()
    }

    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(from) = self.from_ms {
            clauses.push("TimeStamp >= ?");
            params.push(Value::Integer(from));
        }
        if let Some(to) = self.to_ms {
            clauses.push("TimeStamp <= ?");
            params.push(Value::Integer(to));
        }
        if let Some(search) = &self.search {
            clauses.push("instr(WindowTitle, ?) > 0");
            params.push(Value::Text(search.clone()));
        }

        if clauses.is_empty() {
            (CAPTURE_QUERY.to_string(), params)
        } else {
            (
                format!("{} WHERE {}", CAPTURE_QUERY, clauses.join(" AND ")),
                params,
            )
        }
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, FilterError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| FilterError::BadDate(raw.to_string()))
}

fn start_of_day_ms<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> i64 {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    // A DST gap can swallow midnight; fall back to reading it as UTC.
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| midnight.and_utc().timestamp_millis())
}

/// Read-only handle on a copied capture database.
///
/// The connection closes when the reader is dropped, whichever way the caller
/// leaves.
pub struct RecordReader {
    conn: Connection,
    path: PathBuf,
}

impl RecordReader {
    pub fn open(path: &Path) -> Result<Self, ExtractError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ExtractError::Database {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepare the capture projection, narrowed by `filter`.
    pub fn query(&self, filter: &RecordFilter) -> Result<CaptureQuery<'_>, ExtractError> {
        let (sql, params) = filter.to_sql();
        let stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| query_error(&self.path, e))?;
        Ok(CaptureQuery {
            stmt,
            params,
            path: &self.path,
        })
    }
}

/// A prepared capture query, ready to be stepped once.
pub struct CaptureQuery<'conn> {
    stmt: Statement<'conn>,
    params: Vec<Value>,
    path: &'conn Path,
}

impl CaptureQuery<'_> {
    /// Start stepping. The returned iterator is forward-only; run the query
    /// again for a fresh pass.
    pub fn records(&mut self) -> Result<Records<'_>, ExtractError> {
        let path = self.path;
        let rows = self
            .stmt
            .query(params_from_iter(self.params.iter()))
            .map_err(|e| query_error(path, e))?;
        Ok(Records {
            rows,
            path,
            done: false,
        })
    }
}

pub struct Records<'stmt> {
    rows: Rows<'stmt>,
    path: &'stmt Path,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<CaptureRecord, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let path = self.path;
        let item = match self.rows.next() {
            Ok(Some(row)) => CaptureRecord::from_row(row).map_err(|e| query_error(path, e)),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(query_error(path, e)),
        };
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

fn query_error(path: &Path, err: rusqlite::Error) -> ExtractError {
    let unreadable_file = matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::NotADatabase | ErrorCode::CannotOpen | ErrorCode::DatabaseCorrupt)
    );
    if unreadable_file {
        ExtractError::Database {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    } else {
        ExtractError::Schema {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OutcomeTag;
    use chrono::Utc;
    use rusqlite::params;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir, rows: &[(Option<&str>, i64, Option<&str>)]) -> PathBuf {
        let path = dir.path().join("ukg.db");
        let conn = Connection::open(&path).expect("create db");
        conn.execute_batch(
            "CREATE TABLE WindowCapture (
                Id INTEGER PRIMARY KEY,
                WindowTitle TEXT,
                TimeStamp INTEGER,
                ImageToken TEXT
            );",
        )
        .expect("schema");
        for (title, ts, token) in rows {
            conn.execute(
                "INSERT INTO WindowCapture (WindowTitle, TimeStamp, ImageToken) VALUES (?1, ?2, ?3)",
                params![title, ts, token],
            )
            .expect("insert");
        }
        path
    }

    fn read_all(path: &Path, filter: &RecordFilter) -> Vec<CaptureRecord> {
        let reader = RecordReader::open(path).expect("open");
        let mut query = reader.query(filter).expect("prepare");
        query
            .records()
            .expect("step")
            .collect::<Result<_, _>>()
            .expect("rows")
    }

    #[test]
    fn yields_rows_in_order_with_nulls_absent() {
        let dir = TempDir::new().expect("tempdir");
        let path = fixture(
            &dir,
            &[
                (Some("Notepad"), 1000, Some("tok1")),
                (None, 1001, Some("tok2")),
                (Some("Browser"), 1002, None),
            ],
        );

        let records = read_all(&path, &RecordFilter::default());
        assert_eq!(
            records,
            vec![
                CaptureRecord {
                    window_title: Some("Notepad".into()),
                    timestamp: Some(1000),
                    image_token: Some("tok1".into()),
                },
                CaptureRecord {
                    window_title: None,
                    timestamp: Some(1001),
                    image_token: Some("tok2".into()),
                },
                CaptureRecord {
                    window_title: Some("Browser".into()),
                    timestamp: Some(1002),
                    image_token: None,
                },
            ]
        );
    }

    #[test]
    fn iteration_is_single_pass_but_query_can_rerun() {
        let dir = TempDir::new().expect("tempdir");
        let path = fixture(&dir, &[(Some("a"), 1, None), (Some("b"), 2, None)]);
        let reader = RecordReader::open(&path).expect("open");
        let mut query = reader.query(&RecordFilter::default()).expect("prepare");

        let mut rows = query.records().expect("step");
        assert!(rows.next().is_some());
        assert!(rows.next().is_some());
        assert!(rows.next().is_none());
        assert!(rows.next().is_none());
        drop(rows);

        assert_eq!(query.records().expect("step again").count(), 2);
    }

    #[test]
    fn missing_table_is_schema_mismatch_with_sqlite_text() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("ukg.db");
        Connection::open(&path)
            .expect("create")
            .execute_batch("CREATE TABLE Other (x INTEGER);")
            .expect("schema");

        let reader = RecordReader::open(&path).expect("open");
        let err = reader
            .query(&RecordFilter::default())
            .err()
            .expect("prepared against missing table");
        assert_eq!(err.tag(), OutcomeTag::SchemaMismatch);
        assert!(err.to_string().contains("no such table: WindowCapture"), "{err}");
    }

    #[test]
    fn missing_column_is_schema_mismatch() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("ukg.db");
        Connection::open(&path)
            .expect("create")
            .execute_batch("CREATE TABLE WindowCapture (WindowTitle TEXT, TimeStamp INTEGER);")
            .expect("schema");

        let reader = RecordReader::open(&path).expect("open");
        let err = reader.query(&RecordFilter::default()).err().expect("prepared");
        assert_eq!(err.tag(), OutcomeTag::SchemaMismatch);
        assert!(err.to_string().contains("ImageToken"), "{err}");
    }

    #[test]
    fn error_mid_listing_ends_the_pass_and_query_can_rerun() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("ukg.db");
        // abs() of the smallest integer raises "integer overflow" while
        // stepping the second row, after the first has been handed out.
        Connection::open(&path)
            .expect("create")
            .execute_batch(
                "CREATE TABLE Raw (n INTEGER PRIMARY KEY, title TEXT);
                 INSERT INTO Raw VALUES (1, 'first'), (2, 'second'), (3, 'third');
                 CREATE VIEW WindowCapture AS
                 SELECT title AS WindowTitle,
                        CASE WHEN n = 2 THEN abs(n - 2 - 9223372036854775807 - 1) ELSE n END
                            AS TimeStamp,
                        'tok' AS ImageToken
                 FROM Raw;",
            )
            .expect("schema");

        let reader = RecordReader::open(&path).expect("open");
        let mut query = reader.query(&RecordFilter::default()).expect("prepare");
        let mut rows = query.records().expect("step");

        let first = rows.next().expect("first row").expect("readable");
        assert_eq!(first.window_title.as_deref(), Some("first"));
        let err = rows.next().expect("second row").expect_err("overflow surfaced");
        assert_eq!(err.tag(), OutcomeTag::SchemaMismatch);
        assert!(err.to_string().contains("integer overflow"), "{err}");
        assert!(rows.next().is_none());
        drop(rows);

        let mut again = query.records().expect("step again");
        let first = again.next().expect("first row").expect("readable");
        assert_eq!(first.timestamp, Some(1));
        drop(again);
        drop(query);
        drop(reader);
        fs::remove_file(&path).expect("database released");
    }

    #[test]
    fn missing_file_is_database_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let err = RecordReader::open(&dir.path().join("absent.db"))
            .err()
            .expect("opened missing file");
        assert_eq!(err.tag(), OutcomeTag::DatabaseUnavailable);
    }

    #[test]
    fn garbage_file_is_database_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("ukg.db");
        fs::write(&path, vec![0x5Au8; 4096]).expect("write");
        let err = match RecordReader::open(&path) {
            Err(e) => e,
            Ok(reader) => reader
                .query(&RecordFilter::default())
                .err()
                .expect("prepared against garbage"),
        };
        assert_eq!(err.tag(), OutcomeTag::DatabaseUnavailable);
    }

    #[test]
    fn text_timestamps_and_numeric_titles_are_coerced() {
        let dir = TempDir::new().expect("tempdir");
        let path = fixture(&dir, &[]);
        Connection::open(&path)
            .expect("open rw")
            .execute(
                "INSERT INTO WindowCapture (WindowTitle, TimeStamp, ImageToken) VALUES (42, '77', NULL)",
                [],
            )
            .expect("insert");

        let records = read_all(&path, &RecordFilter::default());
        assert_eq!(records[0].window_title.as_deref(), Some("42"));
        assert_eq!(records[0].timestamp, Some(77));
    }

    #[test]
    fn filter_from_dates_covers_whole_days() {
        let filter =
            RecordFilter::from_args(Some("2024-06-01"), Some("2024-06-01"), Some(""), &Utc)
                .expect("filter");
        assert_eq!(filter.from_ms, Some(1_717_200_000_000));
        assert_eq!(filter.to_ms, Some(1_717_286_400_000 - 1));
        assert_eq!(filter.search, None);
    }

    #[test]
    fn filter_rejects_bad_input() {
        assert_eq!(
            RecordFilter::from_args(Some("06/01/2024"), None, None, &Utc),
            Err(FilterError::BadDate("06/01/2024".into()))
        );
        assert!(matches!(
            RecordFilter::from_args(Some("2024-06-02"), Some("2024-06-01"), None, &Utc),
            Err(FilterError::EmptyRange { .. })
        ));
    }

    #[test]
    fn filters_narrow_the_listing() {
        let dir = TempDir::new().expect("tempdir");
        let path = fixture(
            &dir,
            &[
                (Some("Notepad - todo.txt"), 1_717_200_000_000, Some("a")),
                (Some("Browser"), 1_717_250_000_000, Some("b")),
                (Some("Notepad - notes"), 1_717_300_000_000, Some("c")),
                (None, 1_717_210_000_000, Some("d")),
            ],
        );

        let by_day = RecordFilter::from_args(Some("2024-06-01"), Some("2024-06-01"), None, &Utc)
            .expect("filter");
        let tokens: Vec<_> = read_all(&path, &by_day)
            .into_iter()
            .filter_map(|r| r.image_token)
            .collect();
        assert_eq!(tokens, ["a", "b", "d"]);

        let by_title = RecordFilter::from_args(None, None, Some("Notepad"), &Utc).expect("filter");
        let tokens: Vec<_> = read_all(&path, &by_title)
            .into_iter()
            .filter_map(|r| r.image_token)
            .collect();
        assert_eq!(tokens, ["a", "c"]);
    }
}

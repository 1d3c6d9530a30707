//! Upstream data: source adapters, field mapping and the trading calendar.

pub mod calendar;
pub mod csv_dir;
pub mod mapping;
pub mod provider;
pub mod sqlite_source;

pub use calendar::{HolidayCalendar, TradingCalendar, WeekdayCalendar};
pub use csv_dir::CsvDirAdapter;
pub use mapping::{FieldMapping, MappingError};
pub use provider::{DataSourceAdapter, SourceError, SourceRow};
pub use sqlite_source::SqliteSourceAdapter;

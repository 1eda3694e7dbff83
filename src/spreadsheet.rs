use crate::error::{FinancialReportError, Result};
use crate::ingestion::{LoaderOptions, ParsedStatement, StatementLoader, StatementSource};
use calamine::{open_workbook_auto_from_rs, Data, DataType, Reader};
use rust_xlsxwriter::{DocProperties, ExcelDateTime, XlsxError};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// A tabular sheet. `None` cells are empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// The cell at `column` in the first row whose first cell equals `key`.
    pub fn cell(&self, key: &str, column: &str) -> Option<&str> {
        let column = self.column_index(column)?;
        self.rows
            .iter()
            .find(|row| row.first().and_then(|c| c.as_deref()) == Some(key))
            .and_then(|row| row.get(column))
            .and_then(|c| c.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }
}

/// Reads statement spreadsheets and writes workbooks in one concrete file format.
pub trait SpreadsheetIo: Send + Sync {
    fn parse(&self, source: &StatementSource) -> Result<ParsedStatement>;

    fn serialize(&self, workbook: &Workbook) -> Result<Vec<u8>>;

    /// Extension used for serialized workbooks, without the dot.
    fn file_extension(&self) -> &str;
}

/// Every worksheet of an Excel or OpenDocument workbook as rows of cell text.
pub(crate) fn read_excel_sheets(
    bytes: &[u8],
) -> std::result::Result<Vec<(String, Vec<Vec<String>>)>, calamine::Error> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook.worksheet_range(&name)?;
        let rows = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();
        sheets.push((name, rows));
    }
    Ok(sheets)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(text) => text.trim().to_string(),
        Data::Float(number) => number.to_string(),
        Data::Int(number) => number.to_string(),
        // Month headers stored as dates, e.g. "July 2024".
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_datetime()
            .map(|date| date.format("%B %Y").to_string())
            .unwrap_or_else(|| cell.to_string()),
        other => other.to_string(),
    }
}

/// Text written as a number only when it reads back as the same text.
fn as_number(text: &str) -> Option<f64> {
    text.parse::<f64>()
        .ok()
        .filter(|number| number.is_finite() && number.to_string() == text)
}

/// Reads statements through the loader and writes `.xlsx` workbooks.
///
/// The document creation time is pinned so that identical workbooks serialize
/// to identical bytes.
#[derive(Debug, Clone, Default)]
pub struct ExcelWorkbookIo {
    loader: StatementLoader,
}

impl ExcelWorkbookIo {
    pub fn new(options: LoaderOptions) -> Result<Self> {
        Ok(Self {
            loader: StatementLoader::new(options)?,
        })
    }

    /// Reads a workbook back; the first row of each sheet holds the column names.
    pub fn read_workbook(bytes: &[u8]) -> Result<Workbook> {
        let sheets = read_excel_sheets(bytes)
            .map_err(|e| FinancialReportError::Serialization(e.to_string()))?;
        Ok(Workbook {
            sheets: sheets
                .into_iter()
                .map(|(name, rows)| {
                    let mut rows = rows.into_iter();
                    let columns = rows.next().unwrap_or_default();
                    let mut sheet = Sheet::new(name, columns);
                    sheet.rows = rows
                        .map(|row| {
                            row.into_iter()
                                .map(|cell| if cell.is_empty() { None } else { Some(cell) })
                                .collect()
                        })
                        .collect();
                    sheet
                })
                .collect(),
        })
    }

    fn write_xlsx(workbook: &Workbook) -> std::result::Result<Vec<u8>, XlsxError> {
        let mut book = rust_xlsxwriter::Workbook::new();
        let created = ExcelDateTime::from_ymd(2000, 1, 1)?;
        book.set_properties(&DocProperties::new().set_creation_datetime(&created));

        for sheet in &workbook.sheets {
            let worksheet = book.add_worksheet();
            worksheet.set_name(sheet.name.as_str())?;
            for (column, name) in sheet.columns.iter().enumerate() {
                worksheet.write_string(0, column as u16, name.as_str())?;
            }
            for (index, row) in sheet.rows.iter().enumerate() {
                let row_number = index as u32 + 1;
                for (column, cell) in row.iter().enumerate() {
                    let Some(text) = cell.as_deref() else { continue };
                    match as_number(text) {
                        Some(number) => worksheet.write_number(row_number, column as u16, number)?,
                        None => worksheet.write_string(row_number, column as u16, text)?,
                    };
                }
            }
        }
        book.save_to_buffer()
    }
}

impl SpreadsheetIo for ExcelWorkbookIo {
    fn parse(&self, source: &StatementSource) -> Result<ParsedStatement> {
        self.loader.parse(source)
    }

    fn serialize(&self, workbook: &Workbook) -> Result<Vec<u8>> {
        Self::write_xlsx(workbook).map_err(|e| FinancialReportError::Serialization(e.to_string()))
    }

    fn file_extension(&self) -> &str {
        "xlsx"
    }
}

/// Reads statements through the loader and writes workbooks as pretty-printed JSON.
#[derive(Debug, Clone, Default)]
pub struct JsonWorkbookIo {
    loader: StatementLoader,
}

impl JsonWorkbookIo {
    pub fn new(options: LoaderOptions) -> Result<Self> {
        Ok(Self {
            loader: StatementLoader::new(options)?,
        })
    }

    pub fn read_workbook(bytes: &[u8]) -> Result<Workbook> {
        serde_json::from_slice(bytes).map_err(|e| FinancialReportError::Serialization(e.to_string()))
    }
}

impl SpreadsheetIo for JsonWorkbookIo {
    fn parse(&self, source: &StatementSource) -> Result<ParsedStatement> {
        self.loader.parse(source)
    }

    fn serialize(&self, workbook: &Workbook) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(workbook)
            .map_err(|e| FinancialReportError::Serialization(e.to_string()))
    }

    fn file_extension(&self) -> &str {
        "json"
    }
}

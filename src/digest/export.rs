//! Digest export to CSV, JSON and XML

use super::{DigestError, FieldUsage, JoinUsage, TableUsage, Timestamp, UsageDigest};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    Xml,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Xml => "xml",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportMetadata {
    export_date: Timestamp,
    last_updated: Option<Timestamp>,
    total_queries_analyzed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableRow {
    table_name: String,
    schema: String,
    name: String,
    query_count: u64,
    row_count: Option<u64>,
    column_count: Option<usize>,
    first_seen: Timestamp,
    last_seen: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldRow {
    field_name: String,
    table: Option<String>,
    name: String,
    query_count: u64,
    first_seen: Timestamp,
    last_seen: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinRow {
    join_key: String,
    table1: String,
    table2: String,
    join_fields: Option<String>,
    query_count: u64,
    first_seen: Timestamp,
    last_seen: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportDocument {
    metadata: ExportMetadata,
    tables: Vec<TableRow>,
    fields: Vec<FieldRow>,
    joins: Vec<JoinRow>,
}

impl TableRow {
    fn from_usage(key: &str, usage: &TableUsage) -> Self {
        Self {
            table_name: key.to_string(),
            schema: usage.schema.clone(),
            name: usage.name.clone(),
            query_count: usage.query_count,
            row_count: usage.row_count,
            column_count: usage.column_count,
            first_seen: usage.first_seen,
            last_seen: usage.last_seen,
        }
    }

    fn into_usage(self) -> (String, TableUsage) {
        (
            self.table_name,
            TableUsage {
                schema: self.schema,
                name: self.name,
                query_count: self.query_count,
                row_count: self.row_count,
                column_count: self.column_count,
                first_seen: self.first_seen,
                last_seen: self.last_seen,
            },
        )
    }
}

impl FieldRow {
    fn from_usage(key: &str, usage: &FieldUsage) -> Self {
        Self {
            field_name: key.to_string(),
            table: usage.table.clone(),
            name: usage.name.clone(),
            query_count: usage.query_count,
            first_seen: usage.first_seen,
            last_seen: usage.last_seen,
        }
    }

    fn into_usage(self) -> (String, FieldUsage) {
        (
            self.field_name,
            FieldUsage {
                name: self.name,
                table: self.table,
                query_count: self.query_count,
                first_seen: self.first_seen,
                last_seen: self.last_seen,
            },
        )
    }
}

impl JoinRow {
    fn from_usage(key: &str, usage: &JoinUsage) -> Self {
        Self {
            join_key: key.to_string(),
            table1: usage.table1.clone(),
            table2: usage.table2.clone(),
            join_fields: usage.join_fields.clone(),
            query_count: usage.query_count,
            first_seen: usage.first_seen,
            last_seen: usage.last_seen,
        }
    }

    fn into_usage(self) -> (String, JoinUsage) {
        (
            self.join_key,
            JoinUsage {
                table1: self.table1,
                table2: self.table2,
                query_count: self.query_count,
                join_fields: self.join_fields,
                first_seen: self.first_seen,
                last_seen: self.last_seen,
            },
        )
    }
}

impl ExportDocument {
    fn build(digest: &UsageDigest, now: Timestamp) -> Self {
        Self {
            metadata: ExportMetadata {
                export_date: now,
                last_updated: digest.last_updated,
                total_queries_analyzed: digest.usage_count,
            },
            tables: digest
                .tables
                .iter()
                .map(|(key, usage)| TableRow::from_usage(key, usage))
                .collect(),
            fields: digest
                .fields
                .iter()
                .map(|(key, usage)| FieldRow::from_usage(key, usage))
                .collect(),
            joins: digest
                .joins
                .iter()
                .map(|(key, usage)| JoinRow::from_usage(key, usage))
                .collect(),
        }
    }
}

/// `<digest dir>/exports/usage_report_<timestamp>.<ext>`
pub fn default_export_path(digest_path: &Path, format: ExportFormat, now: Timestamp) -> PathBuf {
    digest_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("exports")
        .join(format!(
            "usage_report_{}.{}",
            now.format("%Y%m%d_%H%M%S"),
            format.extension()
        ))
}

/// Write the digest to `path`, returning every file produced
pub fn export(
    digest: &UsageDigest,
    format: ExportFormat,
    path: &Path,
    now: Timestamp,
) -> Result<Vec<PathBuf>, DigestError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| DigestError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let document = ExportDocument::build(digest, now);
    let written = match format {
        ExportFormat::Json => {
            let content = serde_json::to_string_pretty(&document)?;
            write_file(path, content.as_bytes())?;
            vec![path.to_path_buf()]
        }
        ExportFormat::Csv => export_csv(&document, path)?,
        ExportFormat::Xml => {
            let content = render_xml(&document)?;
            write_file(path, &content)?;
            vec![path.to_path_buf()]
        }
    };

    tracing::info!("Exported usage digest as {:?} to {:?}", format, written);
    Ok(written)
}

/// Rebuild a digest from a JSON export
pub fn import_json(path: &Path) -> Result<UsageDigest, DigestError> {
    let content = std::fs::read_to_string(path).map_err(|source| DigestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document: ExportDocument = serde_json::from_str(&content)?;

    Ok(UsageDigest {
        last_updated: document.metadata.last_updated,
        usage_count: document.metadata.total_queries_analyzed,
        tables: document.tables.into_iter().map(TableRow::into_usage).collect(),
        fields: document.fields.into_iter().map(FieldRow::into_usage).collect(),
        joins: document.joins.into_iter().map(JoinRow::into_usage).collect(),
    })
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), DigestError> {
    std::fs::write(path, content).map_err(|source| DigestError::Write {
        path: path.to_path_buf(),
        source,
    })
}

// ==================== CSV ====================

fn csv_sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "usage_report".to_string());
    path.with_file_name(format!("{stem}_{suffix}.csv"))
}

fn write_csv<T: Serialize>(path: &Path, header: &[&str], rows: &[T]) -> Result<(), DigestError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(header)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(|source| DigestError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn export_csv(document: &ExportDocument, path: &Path) -> Result<Vec<PathBuf>, DigestError> {
    let tables_path = csv_sibling(path, "tables");
    let fields_path = csv_sibling(path, "fields");
    let joins_path = csv_sibling(path, "joins");

    write_csv(
        &tables_path,
        &[
            "table_name",
            "schema",
            "name",
            "query_count",
            "row_count",
            "column_count",
            "first_seen",
            "last_seen",
        ],
        &document.tables,
    )?;
    write_csv(
        &fields_path,
        &["field_name", "table", "name", "query_count", "first_seen", "last_seen"],
        &document.fields,
    )?;
    write_csv(
        &joins_path,
        &[
            "join_key",
            "table1",
            "table2",
            "join_fields",
            "query_count",
            "first_seen",
            "last_seen",
        ],
        &document.joins,
    )?;

    Ok(vec![tables_path, fields_path, joins_path])
}

// ==================== XML ====================

fn xml_err(e: impl std::fmt::Display) -> DigestError {
    DigestError::Xml(e.to_string())
}

fn xml_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    value: &str,
) -> Result<(), DigestError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}

fn xml_open<W: std::io::Write>(writer: &mut Writer<W>, name: &str) -> Result<(), DigestError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)
}

fn xml_close<W: std::io::Write>(writer: &mut Writer<W>, name: &str) -> Result<(), DigestError> {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)
}

fn opt_text<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

fn render_xml(document: &ExportDocument) -> Result<Vec<u8>, DigestError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    xml_open(&mut writer, "UsageDigest")?;

    xml_open(&mut writer, "Metadata")?;
    xml_element(&mut writer, "ExportDate", &document.metadata.export_date.to_rfc3339())?;
    xml_element(
        &mut writer,
        "LastUpdated",
        &opt_text(&document.metadata.last_updated.map(|t| t.to_rfc3339())),
    )?;
    xml_element(
        &mut writer,
        "TotalQueriesAnalyzed",
        &document.metadata.total_queries_analyzed.to_string(),
    )?;
    xml_close(&mut writer, "Metadata")?;

    xml_open(&mut writer, "Tables")?;
    for row in &document.tables {
        xml_open(&mut writer, "Table")?;
        xml_element(&mut writer, "TableName", &row.table_name)?;
        xml_element(&mut writer, "Schema", &row.schema)?;
        xml_element(&mut writer, "Name", &row.name)?;
        xml_element(&mut writer, "QueryCount", &row.query_count.to_string())?;
        xml_element(&mut writer, "RowCount", &opt_text(&row.row_count))?;
        xml_element(&mut writer, "ColumnCount", &opt_text(&row.column_count))?;
        xml_element(&mut writer, "FirstSeen", &row.first_seen.to_rfc3339())?;
        xml_element(&mut writer, "LastSeen", &row.last_seen.to_rfc3339())?;
        xml_close(&mut writer, "Table")?;
    }
    xml_close(&mut writer, "Tables")?;

    xml_open(&mut writer, "Fields")?;
    for row in &document.fields {
        xml_open(&mut writer, "Field")?;
        xml_element(&mut writer, "FieldName", &row.field_name)?;
        xml_element(&mut writer, "Table", &opt_text(&row.table))?;
        xml_element(&mut writer, "Name", &row.name)?;
        xml_element(&mut writer, "QueryCount", &row.query_count.to_string())?;
        xml_element(&mut writer, "FirstSeen", &row.first_seen.to_rfc3339())?;
        xml_element(&mut writer, "LastSeen", &row.last_seen.to_rfc3339())?;
        xml_close(&mut writer, "Field")?;
    }
    xml_close(&mut writer, "Fields")?;

    xml_open(&mut writer, "Joins")?;
    for row in &document.joins {
        xml_open(&mut writer, "Join")?;
        xml_element(&mut writer, "JoinKey", &row.join_key)?;
        xml_element(&mut writer, "Table1", &row.table1)?;
        xml_element(&mut writer, "Table2", &row.table2)?;
        xml_element(&mut writer, "JoinFields", &opt_text(&row.join_fields))?;
        xml_element(&mut writer, "QueryCount", &row.query_count.to_string())?;
        xml_element(&mut writer, "FirstSeen", &row.first_seen.to_rfc3339())?;
        xml_element(&mut writer, "LastSeen", &row.last_seen.to_rfc3339())?;
        xml_close(&mut writer, "Join")?;
    }
    xml_close(&mut writer, "Joins")?;

    xml_close(&mut writer, "UsageDigest")?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{JoinRef, UsageDigest};
    use chrono::{TimeZone, Utc};

    fn sample() -> UsageDigest {
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();
        let mut digest = UsageDigest {
            last_updated: Some(t2),
            usage_count: 7,
            ..Default::default()
        };
        digest.add_table("main.orders", "main", "orders", 5, t1);
        digest.add_table("customers", "main", "customers", 2, t2);
        digest.tables.get_mut("main.orders").unwrap().row_count = Some(120);
        digest.add_field("orders.total", 3, t1);
        digest.add_field("name", 1, t2);
        digest.add_join(
            &JoinRef {
                left: "main.orders".to_string(),
                right: "customers".to_string(),
                condition: Some("o.customer_id = c.id AND \"x\" < 'y'".to_string()),
            },
            4,
            t1,
        );
        digest.add_join(
            &JoinRef {
                left: "a".to_string(),
                right: "b".to_string(),
                condition: None,
            },
            1,
            t2,
        );
        digest
    }

    #[test]
    fn test_json_export_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let digest = sample();

        let written = export(&digest, ExportFormat::Json, &path, Utc::now()).unwrap();
        assert_eq!(written, vec![path.clone()]);

        let imported = import_json(&path).unwrap();
        assert_eq!(imported.tables, digest.tables);
        assert_eq!(imported.fields, digest.fields);
        assert_eq!(imported.joins, digest.joins);
        assert_eq!(imported.usage_count, digest.usage_count);
        assert_eq!(imported.last_updated, digest.last_updated);
    }

    #[test]
    fn test_csv_export_writes_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.csv");

        let written = export(&sample(), ExportFormat::Csv, &path, Utc::now()).unwrap();
        let names: Vec<_> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["report_tables.csv", "report_fields.csv", "report_joins.csv"]
        );

        let tables = std::fs::read_to_string(&written[0]).unwrap();
        let mut lines = tables.lines();
        assert_eq!(
            lines.next().unwrap(),
            "table_name,schema,name,query_count,row_count,column_count,first_seen,last_seen"
        );
        assert!(tables.contains("main.orders,main,orders,5,120,,"));

        let mut reader = csv::Reader::from_path(&written[2]).unwrap();
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        let quoted = records
            .iter()
            .find(|r| &r[0] == "main.orders|customers")
            .unwrap();
        assert_eq!(&quoted[3], "o.customer_id = c.id AND \"x\" < 'y'");
    }

    #[test]
    fn test_csv_export_of_empty_digest_has_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let written =
            export(&UsageDigest::default(), ExportFormat::Csv, &path, Utc::now()).unwrap();

        let fields = std::fs::read_to_string(&written[1]).unwrap();
        assert_eq!(
            fields.trim(),
            "field_name,table,name,query_count,first_seen,last_seen"
        );
    }

    #[test]
    fn test_xml_export_escapes_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        export(&sample(), ExportFormat::Xml, &path, Utc::now()).unwrap();

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<UsageDigest>"));
        assert!(xml.contains("<TotalQueriesAnalyzed>7</TotalQueriesAnalyzed>"));
        assert!(xml.contains("<TableName>main.orders</TableName>"));
        assert!(xml.contains("&lt; &apos;y&apos;") || xml.contains("&lt; 'y'"));
        assert!(!xml.contains("< 'y'"));
    }

    #[test]
    fn test_default_export_path() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let path =
            default_export_path(Path::new("/data/usage_digest.json"), ExportFormat::Xml, now);
        assert_eq!(
            path,
            PathBuf::from("/data/exports/usage_report_20240102_030405.xml")
        );
    }
}

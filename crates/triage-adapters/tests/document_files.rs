use std::io::Write;

use triage_adapters::{load_documents, map_record, Rejected};
use triage_core::SaleStatus;

#[test]
fn mongoexport_lines_load_and_map() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"_id":{{"$oid":"65f0c0ffee0000000000abcd"}},"price":{{"$numberDecimal":"41.50"}},"status":"sold","createdAt":{{"$date":"2026-03-01T10:00:00Z"}}}}"#
    )
    .unwrap();
    writeln!(file, r#"{{"ticketGroupId":1200,"qty":"3","buyer":{{"email":" Buyer@Example.COM "}}}}"#).unwrap();
    writeln!(file, r#"{{"price":10}}"#).unwrap();

    let documents = load_documents(file.path()).unwrap();
    assert_eq!(documents.len(), 3);

    let first = map_record(&documents[0]).unwrap();
    assert_eq!(first.external_id, "65f0c0ffee0000000000abcd");
    assert_eq!(first.price, Some(41.5));
    assert_eq!(first.status, Some(SaleStatus::Completed));
    assert!(first.source_created_at.is_some());

    let second = map_record(&documents[1]).unwrap();
    assert_eq!(second.external_id, "1200");
    assert_eq!(second.quantity, Some(3));
    assert_eq!(second.buyer_email.as_deref(), Some("buyer@example.com"));

    assert_eq!(map_record(&documents[2]).unwrap_err(), Rejected::MissingIdentifier);
}

#[test]
fn envelope_file_loads() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"documents":[{{"_id":"A"}},{{"_id":"B"}}]}}"#).unwrap();
    let documents = load_documents(file.path()).unwrap();
    assert_eq!(documents.len(), 2);
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = load_documents(&path).unwrap_err();
    assert!(format!("{err:#}").contains("absent.json"));
}

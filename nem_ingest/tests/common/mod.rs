#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDateTime;
use nem_ingest::{ArchiveDescriptor, ArchiveSource, Result};
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use zip::write::FileOptions;

type Responder = Box<dyn Fn(&ArchiveDescriptor) -> Result<Vec<u8>> + Send + Sync>;

/// In-memory stand-in for NEMWEB; answers every descriptor through a closure
pub struct ScriptedSource {
    respond: Responder,
    pub calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(respond: impl Fn(&ArchiveDescriptor) -> Result<Vec<u8>> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveSource for ScriptedSource {
    async fn fetch(&self, descriptor: &ArchiveDescriptor) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(descriptor)
    }
}

pub fn zip_of(members: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in members {
        writer.start_file(name.as_str(), FileOptions::default()).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn stamp(ts: NaiveDateTime) -> String {
    ts.format("%Y/%m/%d %H:%M:%S").to_string()
}

/// DispatchIS price payload for the given `(timestamp, region, rrp)` rows
pub fn price_csv(rows: &[(NaiveDateTime, &str, f64)]) -> String {
    let mut text = String::from(
        "C,NEMP.WORLD,DISPATCHIS,AEMO,PUBLIC,2025/10/09,00:00:00,0000000000000001,DISPATCHIS,0000000000000001\n\
         I,DISPATCH,PRICE,5,SETTLEMENTDATE,RUNNO,REGIONID,DISPATCHINTERVAL,INTERVENTION,RRP\n",
    );
    for (ts, region, rrp) in rows {
        text.push_str(&format!("D,DISPATCH,PRICE,5,\"{}\",1,{},1,0,{}\n", stamp(*ts), region, rrp));
    }
    text.push_str("C,\"END OF REPORT\",99\n");
    text
}

/// Dispatch_SCADA payload for the given `(timestamp, duid, mw)` rows
pub fn scada_csv(rows: &[(NaiveDateTime, &str, f64)]) -> String {
    let mut text = String::from("I,DISPATCH,UNIT_SCADA,1,SETTLEMENTDATE,DUID,SCADAVALUE,LASTCHANGED\n");
    for (ts, duid, mw) in rows {
        text.push_str(&format!(
            "D,DISPATCH,UNIT_SCADA,1,\"{0}\",{1},{2},\"{0}\"\n",
            stamp(*ts),
            duid,
            mw
        ));
    }
    text.push_str("C,\"END OF REPORT\",99\n");
    text
}

//! Code symbols, keyed by content hash and refreshed on every indexing pass.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use xxhash_rust::xxh3::xxh3_64;

use super::fts::{self, NodeDoc};
use super::model::{NodeType, Symbol, SymbolKind, Verification};
use super::storage_err;
use crate::error::MemoryError;

/// Stable id: same workspace, file, kind, name and signature → same id.
pub fn symbol_id(workspace_id: &str, file_path: &str, kind: SymbolKind, name: &str, signature: &str) -> String {
    let key = format!("{workspace_id}\0{file_path}\0{}\0{name}\0{signature}", kind.as_str());
    format!("{:016x}", xxh3_64(key.as_bytes()))
}

const SYMBOL_COLUMNS: &str = "id, workspace_id, name, kind, file_path, start_line, end_line,
     signature, doc_comment, module_path, last_seen_at";

fn row_to_symbol(row: &Row<'_>) -> rusqlite::Result<Symbol> {
    let kind: String = row.get(3)?;
    Ok(Symbol {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        kind: SymbolKind::parse(&kind).unwrap_or(SymbolKind::Function),
        file_path: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        signature: row.get(7)?,
        doc_comment: row.get(8)?,
        module_path: row.get(9)?,
        last_seen_at: row.get(10)?,
    })
}

pub fn symbol_doc(s: &Symbol) -> NodeDoc {
    let mut body = vec![s.signature.clone(), s.file_path.clone()];
    if !s.module_path.is_empty() {
        body.push(s.module_path.clone());
    }
    if !s.doc_comment.is_empty() {
        body.push(s.doc_comment.clone());
    }
    NodeDoc {
        node_id: s.id.clone(),
        workspace_id: s.workspace_id.clone(),
        node_type: NodeType::Symbol,
        title: s.name.clone(),
        summary: format!("{} {} ({}:{})", s.kind, s.name, s.file_path, s.start_line),
        body: body.join("\n"),
        verification: Verification::Unchecked,
        updated_at: s.last_seen_at,
    }
}

/// Insert or refresh; the id is recomputed from content. Returns true if new.
pub fn upsert_symbol(conn: &Connection, symbol: &mut Symbol) -> Result<bool> {
    if symbol.name.trim().is_empty() {
        return Err(MemoryError::validation("symbol name must not be empty").into());
    }
    if symbol.end_line < symbol.start_line {
        symbol.end_line = symbol.start_line;
    }
    symbol.id = symbol_id(
        &symbol.workspace_id,
        &symbol.file_path,
        symbol.kind,
        &symbol.name,
        &symbol.signature,
    );
    let existed = fts::node_exists(conn, &symbol.id)?;
    conn.execute(
        &format!(
            "INSERT INTO symbol({SYMBOL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 start_line = excluded.start_line,
                 end_line = excluded.end_line,
                 doc_comment = excluded.doc_comment,
                 module_path = excluded.module_path,
                 last_seen_at = excluded.last_seen_at"
        ),
        params![
            symbol.id,
            symbol.workspace_id,
            symbol.name,
            symbol.kind.as_str(),
            symbol.file_path,
            symbol.start_line,
            symbol.end_line,
            symbol.signature,
            symbol.doc_comment,
            symbol.module_path,
            symbol.last_seen_at,
        ],
    )
    .map_err(storage_err)
    .with_context(|| format!("Failed to store symbol {}", symbol.name))?;
    fts::index_doc(conn, &symbol_doc(symbol))?;
    Ok(!existed)
}

pub fn get_symbol(conn: &Connection, id: &str) -> Result<Symbol> {
    conn.query_row(
        &format!("SELECT {SYMBOL_COLUMNS} FROM symbol WHERE id = ?1"),
        params![id],
        row_to_symbol,
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to load symbol")?
    .ok_or_else(|| MemoryError::not_found("symbol", id).into())
}

pub fn find_symbols_by_name(conn: &Connection, workspace_id: &str, name: &str) -> Result<Vec<Symbol>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbol WHERE workspace_id = ?1 AND name = ?2
             ORDER BY file_path, start_line"
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![workspace_id, name], row_to_symbol)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    Ok(rows)
}

pub fn list_symbols(conn: &Connection, workspace_id: &str, file_path: Option<&str>) -> Result<Vec<Symbol>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbol
             WHERE workspace_id = ?1 AND (?2 IS NULL OR file_path = ?2)
             ORDER BY file_path, start_line, name"
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![workspace_id, file_path], row_to_symbol)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    Ok(rows)
}

/// Removing the document cascades edges and vectors.
pub fn delete_symbol(conn: &Connection, id: &str) -> Result<()> {
    fts::remove_doc(conn, id)?;
    let n = conn
        .execute("DELETE FROM symbol WHERE id = ?1", params![id])
        .map_err(storage_err)?;
    if n == 0 {
        return Err(MemoryError::not_found("symbol", id).into());
    }
    Ok(())
}

/// Delete symbols last seen before `cutoff`; returns how many went.
pub fn gc_stale_symbols(conn: &Connection, workspace_id: &str, cutoff: i64) -> Result<usize> {
    let stale: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT id FROM symbol WHERE workspace_id = ?1 AND last_seen_at < ?2")
            .map_err(storage_err)?;
        let ids = stmt
            .query_map(params![workspace_id, cutoff], |row| row.get(0))
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        ids
    };
    for id in &stale {
        delete_symbol(conn, id)?;
    }
    Ok(stale.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testutil::{repo, WS};

    fn sym(name: &str, seen: i64) -> Symbol {
        Symbol {
            id: String::new(),
            workspace_id: WS.into(),
            name: name.into(),
            kind: SymbolKind::Function,
            file_path: "src/lib.rs".into(),
            start_line: 3,
            end_line: 9,
            signature: format!("pub fn {name}()"),
            doc_comment: String::new(),
            module_path: "crate".into(),
            last_seen_at: seen,
        }
    }

    #[test]
    fn id_is_stable_across_line_moves() {
        let (_tmp, repo, _) = repo();
        let mut a = sym("parse", 1);
        assert!(repo.write(|tx| upsert_symbol(tx, &mut a)).unwrap());
        let mut moved = sym("parse", 2);
        moved.start_line = 40;
        moved.end_line = 50;
        assert!(!repo.write(|tx| upsert_symbol(tx, &mut moved)).unwrap());
        assert_eq!(a.id, moved.id);
        let stored = repo.read(|c| get_symbol(c, &a.id)).unwrap();
        assert_eq!(stored.start_line, 40);
        assert_eq!(stored.last_seen_at, 2);
    }

    #[test]
    fn gc_removes_only_stale_symbols() {
        let (_tmp, repo, _) = repo();
        repo.write(|tx| {
            upsert_symbol(tx, &mut sym("old", 100))?;
            upsert_symbol(tx, &mut sym("fresh", 900))?;
            Ok(())
        })
        .unwrap();
        let removed = repo.write(|tx| gc_stale_symbols(tx, WS, 500)).unwrap();
        assert_eq!(removed, 1);
        let left = repo.read(|c| list_symbols(c, WS, None)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "fresh");
        assert!(repo.read(|c| find_symbols_by_name(c, WS, "old")).unwrap().is_empty());
    }
}

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use csv::{ReaderBuilder, Writer};
use serde::{Deserialize, Serialize};
use sqlx::{Row, mysql::MySqlConnection};
use std::{collections::HashSet, fs, path::Path};

use crate::common::{ensure_parent_dir, normalize_claim_id, tmp_path_for};

pub const COL_CLAIM_ID: &str = "Encargo";
pub const COL_DATE: &str = "Fecha Sin.";
pub const COL_CAUSE: &str = "Causa";
pub const COL_INSURER: &str = "Aseguradora";
pub const EXPORT_HEADERS: [&str; 4] = [COL_CLAIM_ID, COL_DATE, COL_CAUSE, COL_INSURER];

const SHEET_DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub claim_id: String,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub insurer: String,
}

impl ClaimRecord {
    pub fn sheet_columns(&self) -> [String; 4] {
        [
            self.claim_id.clone(),
            self.date
                .map(|d| d.format(SHEET_DATE_FORMAT).to_string())
                .unwrap_or_default(),
            self.cause.clone(),
            self.insurer.clone(),
        ]
    }
}

// Claims of Allianz (42) and AllianzBBVA (399) that got an assignment on the target
// day, have no recorded contact yet, and whose assignment history matches the
// first-contact rule (one non-TTR assignment, or a TTR followed by a non-TTR one).
const CLAIMS_SQL: &str = "
WITH
claims_in_range AS (
  SELECT
    e.id_siniestro,
    MAX(e.encargo_fh) AS last_assignment_at,
    MAX(CASE WHEN e.id_causa != 15 THEN e.id_causa ELSE NULL END) AS id_causa
  FROM softline_encargos e
  WHERE e.id_despacho = 2
    AND e.encargo_fh >= ?
    AND e.encargo_fh <  ?
  GROUP BY e.id_siniestro
),
assignment_rank AS (
  SELECT
    e.id_siniestro,
    ROW_NUMBER() OVER (
      PARTITION BY e.id_siniestro
      ORDER BY e.encargo_fh, e.id_encargo
    ) AS rn,
    CASE
      WHEN (COALESCE(e.encargo_estado_ttr, 0) > 0 OR e.encargo_tipo = 12)
      THEN 1 ELSE 0
    END AS is_ttr
  FROM softline_encargos e
  JOIN claims_in_range r ON r.id_siniestro = e.id_siniestro
  WHERE e.id_despacho = 2
),
assignment_info AS (
  SELECT
    id_siniestro,
    COUNT(*) AS n_assignments,
    MAX(CASE WHEN rn = 1 THEN is_ttr ELSE 0 END) AS ttr_1,
    MAX(CASE WHEN rn = 2 THEN is_ttr ELSE 0 END) AS ttr_2
  FROM assignment_rank
  GROUP BY id_siniestro
)
SELECT
  CAST(c.codigo AS CHAR) AS claim_id,
  DATE(s.siniestro_fh) AS claim_date,
  COALESCE(mc.descripcion, '') AS cause,
  CASE
    WHEN s.id_cia = 42 THEN 'Allianz'
    WHEN s.id_cia = 399 THEN 'AllianzBBVA'
    ELSE 'Desconocida'
  END AS insurer
FROM softline_siniestros s
JOIN claims_in_range r ON r.id_siniestro = s.id_siniestro
JOIN softline_siniestros_codigos c
  ON c.id_codigo = s.id_cod_siniestro
 AND c.tipo_codigo = 'siniestro'
LEFT JOIN softline_maestra_causas mc
  ON mc.id_cod = r.id_causa
JOIN assignment_info ai ON ai.id_siniestro = s.id_siniestro
WHERE s.id_despacho = 2
  AND s.id_cia IN (42, 399)
  AND CHAR_LENGTH(c.codigo) >= 9
  AND NOT EXISTS (
    SELECT 1
    FROM softline_encargos e
    JOIN softline_encargos_contactos ec
      ON ec.contactos_id_encargo = e.id_encargo
    WHERE e.id_siniestro = s.id_siniestro
      AND ec.contactos_fechahora IS NOT NULL
  )
  AND (
    (ai.n_assignments = 1 AND ai.ttr_1 = 0)
    OR
    (ai.n_assignments = 2 AND ai.ttr_2 = 0 AND ai.ttr_1 = 1)
  )
ORDER BY r.last_assignment_at DESC, s.id_siniestro DESC
";

/// Inclusive start and exclusive end of `day`.
pub fn day_bounds(day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = day.and_time(chrono::NaiveTime::MIN);
    (start, start + TimeDelta::days(1))
}

pub async fn fetch_claims(conn: &mut MySqlConnection, day: NaiveDate) -> Result<Vec<ClaimRecord>> {
    let (day_start, day_end) = day_bounds(day);
    let rows = sqlx::query(CLAIMS_SQL)
        .bind(day_start)
        .bind(day_end)
        .fetch_all(conn)
        .await
        .with_context(|| format!("Failed running claims query for {day}"))?;

    let mut claims = Vec::with_capacity(rows.len());
    for row in rows {
        let claim_id: Option<String> = row.try_get("claim_id").context("Failed reading claim_id")?;
        let date: Option<NaiveDate> = row
            .try_get("claim_date")
            .context("Failed reading claim_date")?;
        let cause: Option<String> = row.try_get("cause").context("Failed reading cause")?;
        let insurer: Option<String> = row.try_get("insurer").context("Failed reading insurer")?;
        claims.push(ClaimRecord {
            claim_id: claim_id.unwrap_or_default(),
            date,
            cause: cause.unwrap_or_default(),
            insurer: insurer.unwrap_or_default(),
        });
    }
    Ok(claims)
}

/// Writes the export file and returns the number of data rows written.
pub fn export_claims(output_path: &Path, claims: &[ClaimRecord]) -> Result<usize> {
    ensure_parent_dir(output_path)?;
    let tmp_path = tmp_path_for(output_path, "claims_export.csv");

    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating temp export {}", tmp_path.display()))?;
    writer
        .write_record(EXPORT_HEADERS)
        .context("Failed writing export header")?;

    let mut written = 0usize;
    for claim in claims {
        writer
            .write_record(claim.sheet_columns())
            .with_context(|| format!("Failed writing export row for {}", claim.claim_id))?;
        written += 1;
    }
    writer.flush().context("Failed flushing export writer")?;

    fs::rename(&tmp_path, output_path).with_context(|| {
        format!(
            "Failed moving temp export {} to {}",
            tmp_path.display(),
            output_path.display()
        )
    })?;
    Ok(written)
}

/// Reads a previous export. Only the claim id column is mandatory.
pub fn read_claims_csv(path: &Path) -> Result<Vec<ClaimRecord>> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed opening claims file {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed reading header of {}", path.display()))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').trim() == name)
    };

    let Some(id_idx) = column(COL_CLAIM_ID) else {
        bail!("No '{COL_CLAIM_ID}' column in {}", path.display());
    };
    let date_idx = column(COL_DATE);
    let cause_idx = column(COL_CAUSE);
    let insurer_idx = column(COL_INSURER);

    let mut claims = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("Failed reading row {} of {}", line + 2, path.display()))?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .unwrap_or("")
                .to_string()
        };
        claims.push(ClaimRecord {
            claim_id: field(Some(id_idx)),
            date: parse_sheet_date(&field(date_idx)),
            cause: field(cause_idx),
            insurer: field(insurer_idx),
        });
    }
    Ok(claims)
}

fn parse_sheet_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(value, SHEET_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

#[derive(Debug, Clone)]
pub struct SelectionRules<'a> {
    pub min_claim_len: usize,
    pub skip_insurer: Option<&'a str>,
    pub max_claims: Option<usize>,
}

/// Builds the ordered list of claims to look up this run: fresh claims first,
/// then claims carried over from the pending queue. Ids are reduced to digits,
/// short ids and duplicates dropped; the first occurrence of an id wins.
pub fn select_claims(
    fresh: Vec<ClaimRecord>,
    carried_over: Vec<ClaimRecord>,
    rules: &SelectionRules<'_>,
) -> Vec<ClaimRecord> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for mut claim in fresh.into_iter().chain(carried_over) {
        let normalized = normalize_claim_id(&claim.claim_id);
        if normalized.len() < rules.min_claim_len {
            tracing::debug!(claim_id = %claim.claim_id, "Skipping claim with short id");
            continue;
        }
        if rules
            .skip_insurer
            .is_some_and(|skip| claim.insurer.trim().eq_ignore_ascii_case(skip))
        {
            tracing::debug!(claim_id = %claim.claim_id, insurer = %claim.insurer, "Skipping claim of excluded insurer");
            continue;
        }
        if !seen.insert(normalized.clone()) {
            continue;
        }
        claim.claim_id = normalized;
        selected.push(claim);
    }

    if let Some(limit) = rules.max_claims {
        selected.truncate(limit);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn claim(id: &str, insurer: &str) -> ClaimRecord {
        ClaimRecord {
            claim_id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1),
            cause: "colisión".to_string(),
            insurer: insurer.to_string(),
        }
    }

    fn rules() -> SelectionRules<'static> {
        SelectionRules {
            min_claim_len: 9,
            skip_insurer: None,
            max_claims: None,
        }
    }

    #[test]
    fn day_bounds_cover_one_calendar_day() {
        let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let (start, end) = day_bounds(day);
        assert_eq!(start.to_string(), "2024-02-29 00:00:00");
        assert_eq!(end.to_string(), "2024-03-01 00:00:00");
    }

    #[test]
    fn export_is_readable_as_claims_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("export.csv");
        let claims = vec![
            claim("657356095", "Allianz"),
            ClaimRecord {
                date: None,
                ..claim("657356096", "AllianzBBVA")
            },
        ];

        let written = export_claims(&path, &claims).unwrap();
        assert_eq!(written, 2);
        assert!(!path.with_file_name("export.csv.tmp").exists());

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("Encargo,Fecha Sin.,Causa,Aseguradora\n"));
        assert!(content.contains("657356095,01/03/2024,colisión,Allianz"));

        assert_eq!(read_claims_csv(&path).unwrap(), claims);
    }

    #[test]
    fn read_claims_csv_requires_claim_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "Numero,Causa\n1,x\n").unwrap();
        let err = read_claims_csv(&path).unwrap_err();
        assert!(err.to_string().contains("Encargo"));
    }

    #[test]
    fn read_claims_csv_accepts_iso_dates_and_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.csv");
        fs::write(&path, "Fecha Sin.,Encargo\n2024-03-01, 657356095 \n").unwrap();
        let claims = read_claims_csv(&path).unwrap();
        assert_eq!(
            claims,
            vec![ClaimRecord {
                claim_id: "657356095".to_string(),
                date: NaiveDate::from_ymd_opt(2024, 3, 1),
                cause: String::new(),
                insurer: String::new(),
            }]
        );
    }

    #[test]
    fn selection_normalizes_and_drops_short_or_duplicate_ids() {
        let fresh = vec![
            claim("657-356-095", "Allianz"),
            claim("12345", "Allianz"),
            claim("657356095", "Allianz"),
            claim("700000001", "AllianzBBVA"),
        ];
        let selected = select_claims(fresh, Vec::new(), &rules());
        let ids: Vec<_> = selected.iter().map(|c| c.claim_id.as_str()).collect();
        assert_eq!(ids, vec!["657356095", "700000001"]);
    }

    #[test]
    fn fresh_claims_take_precedence_over_carried_over() {
        let mut stale = claim("657356095", "Allianz");
        stale.cause = "old cause".to_string();
        let selected = select_claims(
            vec![claim("657356095", "Allianz")],
            vec![stale, claim("800000002", "Allianz")],
            &rules(),
        );
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].cause, "colisión");
        assert_eq!(selected[1].claim_id, "800000002");
    }

    #[test]
    fn selection_skips_insurer_and_applies_limit() {
        let fresh = vec![
            claim("100000001", "Allianz"),
            claim("100000002", "allianzbbva"),
            claim("100000003", "Allianz"),
            claim("100000004", "Allianz"),
        ];
        let rules = SelectionRules {
            min_claim_len: 9,
            skip_insurer: Some("AllianzBBVA"),
            max_claims: Some(2),
        };
        let ids: Vec<_> = select_claims(fresh, Vec::new(), &rules)
            .into_iter()
            .map(|c| c.claim_id)
            .collect();
        assert_eq!(ids, vec!["100000001", "100000003"]);
    }
}

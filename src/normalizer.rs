//! Maps source-specific customer payloads onto the canonical client record.

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde_json::Value;
use std::str::FromStr;

use crate::models::{CanonicalCandidate, ExternalDebtor, SourceType};

/// Candidate keys per canonical field; the first non-empty one wins.
#[derive(Debug)]
pub struct FieldMapping {
    pub name: &'static [&'static str],
    pub cpf: &'static [&'static str],
    pub email: &'static [&'static str],
    pub phone: &'static [&'static str],
    pub address: &'static [&'static str],
    pub bairro: &'static [&'static str],
    /// Only consulted when the connector did not aggregate titles itself.
    pub debt: &'static [&'static str],
}

static IXC_FIELDS: FieldMapping = FieldMapping {
    name: &["razao", "fantasia"],
    cpf: &["cnpj_cpf"],
    email: &["email"],
    phone: &["telefone_celular", "fone"],
    address: &["endereco"],
    bairro: &["bairro"],
    debt: &["valor_debito"],
};

static MKAUTH_FIELDS: FieldMapping = FieldMapping {
    name: &["name", "full_name"],
    cpf: &["cpf", "document"],
    email: &["email"],
    phone: &["phone", "mobile"],
    address: &["street"],
    bairro: &["neighborhood", "district"],
    debt: &["debt", "debt_amount"],
};

static SGP_FIELDS: FieldMapping = FieldMapping {
    name: &["nome_cliente", "nome"],
    cpf: &["cpf"],
    email: &["email_principal", "email"],
    phone: &["telefone_principal", "telefone"],
    address: &["logradouro", "endereco"],
    bairro: &["bairro"],
    debt: &["valor_em_aberto", "debito"],
};

static RADIUSNET_FIELDS: FieldMapping = FieldMapping {
    name: &["nome", "cliente_nome"],
    cpf: &["cpf", "documento"],
    email: &["email"],
    phone: &["telefone", "contato"],
    address: &["endereco"],
    bairro: &["bairro"],
    debt: &["debito_total", "valor_devido"],
};

pub fn field_mapping(source: SourceType) -> &'static FieldMapping {
    match source {
        SourceType::Ixc => &IXC_FIELDS,
        SourceType::MkAuth => &MKAUTH_FIELDS,
        SourceType::Sgp => &SGP_FIELDS,
        SourceType::Radiusnet => &RADIUSNET_FIELDS,
    }
}

/// Builds the canonical candidate, or `None` when the record is not importable
/// (no name, no tax id, or no positive debt).
pub fn normalize(raw: &ExternalDebtor, source: SourceType) -> Option<CanonicalCandidate> {
    let mapping = field_mapping(source);
    let customer = &raw.customer;

    let name = first_text(customer, mapping.name)?.to_uppercase();
    let cpf = extract_tax_id(raw, source)?;

    let debt_amount = match &raw.debt_amount {
        Some(amount) => amount.clone(),
        None => first_amount(customer, mapping.debt)?,
    };
    if debt_amount <= BigDecimal::from(0) {
        return None;
    }
    let debt_amount = debt_amount.round(2);

    let reason = if raw.titles_count > 0 {
        format!(
            "{} - {} título(s) vencido(s)",
            source.origin_marker(),
            raw.titles_count
        )
    } else {
        source.origin_marker()
    };

    Some(CanonicalCandidate {
        name,
        cpf,
        email: first_text(customer, mapping.email).map(|e| e.to_lowercase()),
        phone: first_text(customer, mapping.phone)
            .map(|p| digits_only(&p))
            .filter(|p| !p.is_empty()),
        address: first_text(customer, mapping.address),
        bairro: first_text(customer, mapping.bairro),
        risk_level: risk_tier(&debt_amount),
        debt_amount,
        reason,
        boletos: raw.boletos.clone(),
    })
}

/// Digits-only tax id (CPF/CNPJ) using the source's field mapping.
pub fn extract_tax_id(raw: &ExternalDebtor, source: SourceType) -> Option<String> {
    first_text(&raw.customer, field_mapping(source).cpf)
        .map(|c| digits_only(&c))
        .filter(|c| !c.is_empty())
}

/// Fixed risk table: `<100 → 1, <300 → 2, <500 → 3, <1000 → 4, else 5`.
pub fn risk_tier(debt: &BigDecimal) -> i16 {
    const THRESHOLDS: [(i64, i16); 4] = [(100, 1), (300, 2), (500, 3), (1000, 4)];

    for (limit, tier) in THRESHOLDS {
        if *debt < BigDecimal::from(limit) {
            return tier;
        }
    }
    5
}

pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Trimmed text of a string or number field.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn first_text(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| obj.get(*key).and_then(value_text))
}

pub fn first_amount(obj: &Value, keys: &[&str]) -> Option<BigDecimal> {
    keys.iter().find_map(|key| obj.get(*key).and_then(parse_amount))
}

/// Accepts JSON numbers, `"50.00"`, `"R$ 1.234,56"` and `"1234,56"`.
pub fn parse_amount(value: &Value) -> Option<BigDecimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().trim_start_matches("R$").trim().to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }

    let canonical = if text.contains(',') {
        // Brazilian format: '.' groups thousands, ',' separates cents
        text.replace('.', "").replace(',', ".")
    } else {
        text
    };
    BigDecimal::from_str(&canonical).ok()
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` and `DD/MM/YYYY`.
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    let text = value.as_str()?.trim();
    let date_part = text.split([' ', 'T']).next().unwrap_or(text);

    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%d/%m/%Y"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn debtor(customer: Value, debt: Option<&str>, titles: usize) -> ExternalDebtor {
        ExternalDebtor {
            external_id: "1".to_string(),
            customer,
            debt_amount: debt.map(|d| BigDecimal::from_str(d).unwrap()),
            titles_count: titles,
            boletos: vec![],
        }
    }

    #[test]
    fn test_ixc_mapping() {
        let raw = debtor(
            json!({
                "razao": "  Maria da Silva ",
                "cnpj_cpf": "111.111.111-11",
                "email": " Maria@Example.COM ",
                "telefone_celular": "(11) 98888-7777",
                "endereco": "Rua A, 10",
                "bairro": "Centro"
            }),
            Some("130.00"),
            2,
        );

        let c = normalize(&raw, SourceType::Ixc).unwrap();
        assert_eq!(c.name, "MARIA DA SILVA");
        assert_eq!(c.cpf, "11111111111");
        assert_eq!(c.email.as_deref(), Some("maria@example.com"));
        assert_eq!(c.phone.as_deref(), Some("11988887777"));
        assert_eq!(c.bairro.as_deref(), Some("Centro"));
        assert_eq!(c.risk_level, 2);
        assert_eq!(c.reason, "Importado do IXC - 2 título(s) vencido(s)");
    }

    #[test]
    fn test_fallback_keys_and_numeric_fields() {
        let raw = debtor(
            json!({
                "fantasia": "Loja do Zé",
                "cnpj_cpf": 12345678000199u64,
                "fone": 1133334444u64
            }),
            Some("50"),
            1,
        );
        let c = normalize(&raw, SourceType::Ixc).unwrap();
        assert_eq!(c.name, "LOJA DO ZÉ");
        assert_eq!(c.cpf, "12345678000199");
        assert_eq!(c.phone.as_deref(), Some("1133334444"));
    }

    #[test]
    fn test_mkauth_sgp_radiusnet_mappings() {
        let mk = debtor(
            json!({"full_name": "Ana", "document": "222.222.222-22", "district": "Sul", "debt": "450,00"}),
            None,
            0,
        );
        let c = normalize(&mk, SourceType::MkAuth).unwrap();
        assert_eq!(c.cpf, "22222222222");
        assert_eq!(c.bairro.as_deref(), Some("Sul"));
        assert_eq!(c.debt_amount, BigDecimal::from(450));
        assert_eq!(c.risk_level, 3);
        assert_eq!(c.reason, "Importado do MK-AUTH");

        let sgp = debtor(
            json!({"nome": "Bruno", "cpf": "333", "email": "b@x.com", "telefone": "9"}),
            Some("10"),
            1,
        );
        let c = normalize(&sgp, SourceType::Sgp).unwrap();
        assert_eq!(c.name, "BRUNO");
        assert_eq!(c.email.as_deref(), Some("b@x.com"));

        let rn = debtor(
            json!({"cliente_nome": "Carla", "documento": "444", "contato": "55 99"}),
            Some("1000"),
            2,
        );
        let c = normalize(&rn, SourceType::Radiusnet).unwrap();
        assert_eq!(c.name, "CARLA");
        assert_eq!(c.phone.as_deref(), Some("5599"));
        assert_eq!(c.risk_level, 5);
    }

    #[test]
    fn test_rejects_missing_cpf_or_non_positive_debt() {
        let no_cpf = debtor(json!({"razao": "X", "cnpj_cpf": "  "}), Some("100"), 1);
        assert!(normalize(&no_cpf, SourceType::Ixc).is_none());

        let zero = debtor(json!({"razao": "X", "cnpj_cpf": "1"}), Some("0"), 1);
        assert!(normalize(&zero, SourceType::Ixc).is_none());

        let no_debt = debtor(json!({"razao": "X", "cnpj_cpf": "1"}), None, 0);
        assert!(normalize(&no_debt, SourceType::Ixc).is_none());

        let no_name = debtor(json!({"cnpj_cpf": "1"}), Some("10"), 1);
        assert!(normalize(&no_name, SourceType::Ixc).is_none());
    }

    #[test]
    fn test_risk_tier_boundaries() {
        let tier = |s: &str| risk_tier(&BigDecimal::from_str(s).unwrap());
        assert_eq!(tier("99.99"), 1);
        assert_eq!(tier("100.00"), 2);
        assert_eq!(tier("299.99"), 2);
        assert_eq!(tier("300"), 3);
        assert_eq!(tier("999.99"), 4);
        assert_eq!(tier("1000.00"), 5);
    }

    #[test]
    fn test_parse_amount_formats() {
        let d = |s: &str| BigDecimal::from_str(s).unwrap();
        assert_eq!(parse_amount(&json!(50.5)), Some(d("50.5")));
        assert_eq!(parse_amount(&json!("50.00")), Some(d("50")));
        assert_eq!(parse_amount(&json!("1.234,56")), Some(d("1234.56")));
        assert_eq!(parse_amount(&json!("R$ 80,00")), Some(d("80")));
        assert_eq!(parse_amount(&json!("")), None);
        assert_eq!(parse_amount(&json!(null)), None);
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1);
        assert_eq!(parse_date(&json!("2024-03-01")), expected);
        assert_eq!(parse_date(&json!("2024-03-01 00:00:00")), expected);
        assert_eq!(parse_date(&json!("01/03/2024")), expected);
        assert_eq!(parse_date(&json!("0000-00-00")), None);
    }
}

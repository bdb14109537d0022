//! Display-label tables and cell formatting for feed codes.

pub const LABEL_PAYED: &str = "결제완료";
pub const LABEL_DISPATCHING: &str = "배송중";
pub const LABEL_DELIVERED: &str = "배송완료";
pub const LABEL_PURCHASE_DECIDED: &str = "구매확정";
pub const LABEL_CANCEL: &str = "취소";
pub const LABEL_RETURN: &str = "반품";
pub const LABEL_EXCHANGE: &str = "교환";
pub const LABEL_UNDECIDED: &str = "미확정";

fn status_label(code: &str) -> Option<&'static str> {
    let label = match code {
        "PAYMENT_WAITING" => "입금대기",
        "PAYED" | "PAID" | "PAYMENT_COMPLETED" => LABEL_PAYED,
        "PRODUCT_PREPARATION" => "배송준비",
        "DISPATCHED" => "발송처리",
        "DELIVERY" | "DELIVERING" => LABEL_DISPATCHING,
        "DELIVERED" | "DELIVERY_COMPLETED" => LABEL_DELIVERED,
        "PURCHASE_DECIDED" => LABEL_PURCHASE_DECIDED,
        "CANCEL" => LABEL_CANCEL,
        "CANCELED" | "CANCEL_DONE" => "취소완료",
        "ADMIN_CANCEL" | "ADMIN_CANCELED" => "관리자직권취소",
        "RETURN" => LABEL_RETURN,
        "RETURNED" | "RETURN_DONE" => "반품완료",
        "RETURN_REQUEST" => "반품요청",
        "RETURN_REJECT" => "반품거부",
        "COLLECTING" => "수거중",
        "COLLECT_DONE" => "수거완료",
        "EXCHANGE" => LABEL_EXCHANGE,
        "EXCHANGED" | "EXCHANGE_DONE" => "교환완료",
        "EXCHANGE_REQUEST" => "교환요청",
        "EXCHANGE_REDELIVERING" => "교환재배송",
        _ => return None,
    };
    Some(label)
}

/// Status/claim code to display label. Unknown codes pass through
/// upper-cased; blank input stays blank.
pub fn translate_status(code: Option<&str>) -> String {
    let code = code.unwrap_or_default().trim().to_uppercase();
    if code.is_empty() {
        return String::new();
    }
    status_label(&code).map(str::to_string).unwrap_or(code)
}

/// A claim raised against an order that already reached a terminal-success
/// state is shown as withdrawn.
pub fn reclassify_claim(status_label: &str, claim_label: String) -> String {
    match (status_label, claim_label.as_str()) {
        (LABEL_PURCHASE_DECIDED, LABEL_RETURN) => "반품철회".to_string(),
        (LABEL_PURCHASE_DECIDED, LABEL_EXCHANGE) => "교환철회".to_string(),
        (LABEL_PAYED | LABEL_DISPATCHING | LABEL_DELIVERED, LABEL_CANCEL) => "취소철회".to_string(),
        _ => claim_label,
    }
}

pub fn translate_courier(code: Option<&str>) -> String {
    let raw = code.unwrap_or_default();
    let normalized: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    let label = match normalized.as_str() {
        "" => return String::new(),
        "CJGLS" | "KOREX" => "CJ대한통운",
        "HANJIN" => "한진택배",
        "POST" => "우체국택배",
        "LOGEN" => "로젠택배",
        "LOTTE" | "HYUNDAI" => "롯데택배",
        "KDEXP" => "경동택배",
        "DAESIN" => "대신택배",
        _ => return raw.to_string(),
    };
    label.to_string()
}

pub fn tracking_url(courier: &str, tracking_number: &str) -> String {
    if courier.is_empty() || tracking_number.trim().is_empty() {
        return String::new();
    }
    let no = tracking_number.replace('-', "");
    let no = no.trim();
    if courier.contains("CJ") {
        format!("https://trace.cjlogistics.com/next/tracking.html?wblNo={no}")
    } else if courier.contains("한진") {
        format!("https://www.hanjin.com/kor/CMS/DeliveryMgr/WaybillResult.do?mCode=MN038&wblnum={no}&schLang=KR&wblnumText=")
    } else if courier.contains("우체국") {
        format!("https://service.epost.go.kr/trace.RetrieveDomRgiTraceList.comm?sid1={no}")
    } else if courier.contains("로젠") {
        format!("https://www.ilogen.com/web/personal/trace/{no}")
    } else if courier.contains("롯데") {
        format!("https://www.lotteglogis.com/home/reservation/tracking/linkView?InvNo={no}")
    } else {
        format!("https://search.naver.com/search.naver?query={courier}+{no}")
    }
}

const INFLOW_LABELS: &[(&str, &str)] = &[
    ("SHOPPING_SEARCH_AD", "쇼핑검색광고"),
    ("SEARCH_AD", "쇼핑검색광고"),
    ("BRAND_SEARCH", "브랜드검색광고"),
    ("DISPLAY_AD", "디스플레이광고"),
    ("GFA", "성과형디스플레이"),
    ("ADVBOOST", "ADVoost"),
    ("ADVOOST", "ADVoost"),
    ("NAVER_SHOPPING", "네이버쇼핑"),
    ("PRICE_COMPARISON", "가격비교"),
    ("CATALOG", "카탈로그"),
    ("NAVER_SEARCH", "네이버검색"),
    ("NAVER_SERVICE", "네이버서비스"),
    ("SMARTSTORE", "스마트스토어"),
    ("STORE_HOME", "스토어홈"),
    ("STORE_SEARCH", "스토어검색"),
    ("NPLUS_STORE", "N+스토어앱"),
    ("DIRECT", "직접유입"),
    ("EXTERNAL", "외부유입"),
    ("SNS", "SNS"),
    ("KAKAO", "카카오"),
    ("INSTAGRAM", "인스타그램"),
];

fn is_null_token(value: &str) -> bool {
    matches!(value.to_uppercase().as_str(), "" | "NULL" | "UNDEFINED" | "NONE")
}

/// Inflow-path code to label: exact code first, then the longest code
/// contained in the value. The detail field is appended in parentheses.
pub fn translate_inflow_path(path: Option<&str>, detail: Option<&str>) -> String {
    let path = path.unwrap_or_default().trim();
    if is_null_token(path) {
        return String::new();
    }
    let detail = detail.unwrap_or_default().trim();
    let detail = if is_null_token(detail) || detail == "-" {
        ""
    } else {
        detail
    };

    let upper = path.to_uppercase();
    let exact = INFLOW_LABELS
        .iter()
        .find(|(code, _)| *code == upper)
        .map(|(_, label)| *label);
    let label = exact.or_else(|| {
        let mut by_length: Vec<_> = INFLOW_LABELS.iter().collect();
        by_length.sort_by_key(|(code, _)| std::cmp::Reverse(code.len()));
        by_length
            .into_iter()
            .find(|(code, _)| upper.contains(code))
            .map(|(_, label)| *label)
    });

    let base = label.unwrap_or(path);
    if detail.is_empty() {
        base.to_string()
    } else {
        format!("{base}({detail})")
    }
}

/// Grouped-digit rendering; missing or zero amounts render as `0`.
pub fn format_amount(value: Option<i64>) -> String {
    let Some(n) = value.filter(|n| *n != 0) else {
        return "0".to_string();
    };
    let digits = n.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        grouped.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

/// Margin over payment as a one-decimal percentage; `0%` when nothing was paid.
pub fn format_rate(margin: i64, payment: i64) -> String {
    if payment <= 0 {
        return "0%".to_string();
    }
    let rate = margin as f64 / payment as f64 * 100.0;
    format!("{rate:.1}%")
}

/// `2024-01-15T10:11:12.345+09:00` → `2024-01-15 10:11:12`.
pub fn format_timestamp(raw: Option<&str>) -> Option<String> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
    let head = raw.split('.').next().unwrap_or(raw);
    Some(head.replace('T', " "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_codes_pass_through() {
        assert_eq!(translate_status(Some("payed")), "결제완료");
        assert_eq!(translate_status(Some("PAID")), "결제완료");
        assert_eq!(translate_status(Some("CANCELED")), "취소완료");
        assert_eq!(translate_status(Some("something_new")), "SOMETHING_NEW");
        assert_eq!(translate_status(None), "");
    }

    #[test]
    fn claims_on_finalized_orders_read_as_withdrawn() {
        assert_eq!(reclassify_claim("구매확정", "반품".into()), "반품철회");
        assert_eq!(reclassify_claim("구매확정", "교환".into()), "교환철회");
        assert_eq!(reclassify_claim("배송완료", "취소".into()), "취소철회");
        assert_eq!(reclassify_claim("배송완료", "반품".into()), "반품");
        assert_eq!(reclassify_claim("취소완료", "취소".into()), "취소");
    }

    #[test]
    fn amounts_group_digits_and_never_fail() {
        assert_eq!(format_amount(Some(1_234_567)), "1,234,567");
        assert_eq!(format_amount(Some(-4500)), "-4,500");
        assert_eq!(format_amount(Some(999)), "999");
        assert_eq!(format_amount(Some(0)), "0");
        assert_eq!(format_amount(None), "0");
    }

    #[test]
    fn margin_rate_guards_zero_payment() {
        assert_eq!(format_rate(3_000, 10_000), "30.0%");
        assert_eq!(format_rate(1, 3), "33.3%");
        assert_eq!(format_rate(500, 0), "0%");
    }

    #[test]
    fn couriers_and_tracking_links() {
        assert_eq!(translate_courier(Some("cj gls")), "CJ대한통운");
        assert_eq!(translate_courier(Some("ACME")), "ACME");
        assert_eq!(translate_courier(None), "");
        assert_eq!(
            tracking_url("CJ대한통운", "1234-5678"),
            "https://trace.cjlogistics.com/next/tracking.html?wblNo=12345678"
        );
        assert_eq!(tracking_url("", "1234"), "");
    }

    #[test]
    fn inflow_paths_prefer_exact_then_longest_match() {
        assert_eq!(translate_inflow_path(Some("search_ad"), None), "쇼핑검색광고");
        assert_eq!(
            translate_inflow_path(Some("X_NAVER_SHOPPING_Y"), Some("모바일")),
            "네이버쇼핑(모바일)"
        );
        assert_eq!(translate_inflow_path(Some("null"), Some("x")), "");
        assert_eq!(translate_inflow_path(Some("blog"), Some("-")), "blog");
    }

    #[test]
    fn timestamps_drop_fraction_and_separator() {
        assert_eq!(
            format_timestamp(Some("2024-01-15T10:11:12.345+09:00")).as_deref(),
            Some("2024-01-15 10:11:12")
        );
        assert_eq!(format_timestamp(Some("  ")), None);
    }
}

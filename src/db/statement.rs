// Statement Inspection
// Lightweight SQL classification and static advice attached to execution plans

/// Skip whitespace and comments, returning the remaining text
fn skip_trivia(mut sql: &str) -> &str {
    loop {
        let trimmed = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(rest) = trimmed.strip_prefix("--") {
            sql = rest.find('\n').map(|i| &rest[i + 1..]).unwrap_or("");
        } else if let Some(rest) = trimmed.strip_prefix("/*") {
            sql = rest.find("*/").map(|i| &rest[i + 2..]).unwrap_or("");
        } else {
            return trimmed;
        }
    }
}

/// First keyword of the statement, uppercased
pub fn leading_keyword(sql: &str) -> String {
    skip_trivia(sql)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// True for plain queries that are safe to run just to gather plan statistics
pub fn is_read_only(sql: &str) -> bool {
    let upper = normalize(sql);
    let keyword = leading_keyword(sql);
    if keyword != "SELECT" && keyword != "WITH" {
        return false;
    }
    if upper.contains(" FOR UPDATE") {
        return false;
    }
    // Data-modifying CTEs
    !(keyword == "WITH"
        && ["INSERT ", "UPDATE ", "DELETE ", "MERGE "]
            .iter()
            .any(|kw| upper.contains(kw)))
}

/// True for statements that produce a result set, even an empty one
pub fn returns_rows(sql: &str) -> bool {
    matches!(
        leading_keyword(sql).as_str(),
        "SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE"
    )
}

/// Insert an optimizer hint right after the first SELECT keyword
pub fn insert_hint(sql: &str, hint: &str) -> String {
    let upper = sql.to_ascii_uppercase();
    let mut search_from = 0;
    while let Some(pos) = upper[search_from..].find("SELECT") {
        let start = search_from + pos;
        let end = start + "SELECT".len();
        let before_ok = start == 0 || !is_word_byte(upper.as_bytes()[start - 1]);
        let after_ok = end >= upper.len() || !is_word_byte(upper.as_bytes()[end]);
        if before_ok && after_ok {
            return format!("{} {}{}", &sql[..end], hint, &sql[end..]);
        }
        search_from = end;
    }
    sql.to_string()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Uppercase with runs of whitespace collapsed to a single space
fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Static hints about common query anti-patterns
pub fn sql_advice(sql: &str) -> Vec<String> {
    let upper = normalize(sql);
    let keyword = leading_keyword(sql);
    let mut advice = Vec::new();

    if upper.contains("SELECT *") {
        advice.push(
            "Avoid SELECT *; list only the columns you need to reduce I/O and network transfer"
                .to_string(),
        );
    }

    if (keyword == "UPDATE" || keyword == "DELETE") && !upper.contains(" WHERE ") {
        advice.push(format!(
            "{} without a WHERE clause affects every row in the table",
            keyword
        ));
    }

    if upper.contains("LIKE '%") {
        advice.push(
            "Leading wildcard in LIKE prevents index usage; consider full-text search or a reversed index"
                .to_string(),
        );
    }

    let bounded = upper.contains(" LIMIT ")
        || upper.contains("FETCH FIRST")
        || upper.contains("ROWNUM");
    if upper.contains("ORDER BY") && !bounded {
        advice.push(
            "ORDER BY without a row limit sorts the full result set; add LIMIT or FETCH FIRST if only the top rows are needed"
                .to_string(),
        );
    }

    advice
}

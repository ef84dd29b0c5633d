//! Arabic and Chinese numerals as spoken in volume requests.

const CHINESE_NUMERAL_CHARS: &str = "零〇一二两三四五六七八九十百";

/// Whether `c` can appear in a Chinese numeral.
pub fn is_chinese_numeral(c: char) -> bool {
    CHINESE_NUMERAL_CHARS.contains(c)
}

fn digit_value(c: char) -> Option<u32> {
    Some(match c {
        '零' | '〇' => 0,
        '一' => 1,
        '二' | '两' => 2,
        '三' => 3,
        '四' => 4,
        '五' => 5,
        '六' => 6,
        '七' => 7,
        '八' => 8,
        '九' => 9,
        _ => return None,
    })
}

/// Parse a Chinese numeral up to the hundreds.
///
/// Accepts `十`, `十五`, `四十`, `四十五`, `两`, `百`, `一百`, `三百零五` and
/// the like. Returns `None` for anything else.
pub fn parse_chinese(token: &str) -> Option<u32> {
    let chars: Vec<char> = token.trim().chars().collect();
    if chars.is_empty() {
        return None;
    }

    let (hundreds, rest) = match chars.iter().position(|&c| c == '百') {
        Some(0) => (1, &chars[1..]),
        Some(1) => (digit_value(chars[0])?, &chars[2..]),
        Some(_) => return None,
        None => (0, &chars[..]),
    };
    // "一百零五" → the zero is only a filler.
    let rest = match rest.first() {
        Some('零' | '〇') if hundreds > 0 => &rest[1..],
        _ => rest,
    };

    let below_hundred = match rest.iter().position(|&c| c == '十') {
        Some(pos) => {
            let tens = match pos {
                0 => 1,
                1 => digit_value(rest[0])?,
                _ => return None,
            };
            let ones = match &rest[pos + 1..] {
                [] => 0,
                [c] => digit_value(*c)?,
                _ => return None,
            };
            tens * 10 + ones
        }
        None => match rest {
            [] => 0,
            [c] => digit_value(*c)?,
            _ => return None,
        },
    };

    if hundreds == 0 && rest.is_empty() {
        return None;
    }
    Some(hundreds * 100 + below_hundred)
}

/// Parse ASCII digits or a Chinese numeral.
pub fn parse_number(token: &str) -> Option<u32> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        return token.parse().ok();
    }
    parse_chinese(token)
}

/// Parse the number at the very start of `text`, skipping a leading
/// `百分之`. Returns the value and the remaining text.
pub fn leading_number(text: &str) -> Option<(u32, &str)> {
    let text = text.strip_prefix("百分之").unwrap_or(text);
    let digits_end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(text.len(), |(i, _)| i);
    if digits_end > 0 {
        let value = text[..digits_end].parse().ok()?;
        return Some((value, &text[digits_end..]));
    }

    // Longest prefix of numeral chars that parses.
    let ends: Vec<usize> = text
        .char_indices()
        .take_while(|(_, c)| is_chinese_numeral(*c))
        .map(|(i, c)| i + c.len_utf8())
        .collect();
    ends.iter()
        .rev()
        .find_map(|&end| parse_chinese(&text[..end]).map(|v| (v, &text[end..])))
}

/// Clamp to a 0–100 percentage.
pub fn clamp_percent(value: u32) -> u8 {
    value.min(100) as u8
}

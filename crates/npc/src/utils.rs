use ninep::{Stat, dm};

/// Render a stat the way `ls -l` would.
pub fn ls_line(stat: &Stat) -> String {
    format!(
        "{} {} {} {:>10} {}",
        mode_string(stat.mode),
        stat.uid,
        stat.gid,
        stat.length,
        stat.name
    )
}

pub fn mode_string(mode: u32) -> String {
    let mut s = String::with_capacity(10);
    s.push(if mode & dm::DIR != 0 {
        'd'
    } else if mode & dm::APPEND != 0 {
        'a'
    } else {
        '-'
    });
    for shift in [6, 3, 0] {
        let bits = mode >> shift;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_string_directory() {
        assert_eq!(mode_string(dm::DIR | 0o755), "drwxr-xr-x");
    }

    #[test]
    fn mode_string_append_file() {
        assert_eq!(mode_string(dm::APPEND | 0o600), "arw-------");
    }

    #[test]
    fn mode_string_plain() {
        assert_eq!(mode_string(0o644), "-rw-r--r--");
    }
}

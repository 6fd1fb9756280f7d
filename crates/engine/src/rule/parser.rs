//! 규칙 표현식 파서
//!
//! ```text
//! expr  := and_e ( "or"  and_e )*
//! and_e := seq   ( "and" seq   )*
//! seq   := unit  ( "|"  unit  )*
//! unit  := "not" leaf | "not" "(" leaf ")" | leaf | "(" expr ")"
//! leaf  := proto [ "." field op value ]
//! ```
//!
//! `|`는 "다음 레이어"입니다. `ethernet | ipv4.src == 10.0.0.1 | tcp`는
//! 세 레이어를 차례로 검사합니다. AND/OR의 두 피연산자는 같은 레이어에서 시작합니다.
//!
//! 잎 노드를 만들 때마다 프로토콜 참조 카운트를 올리고, 파싱이 실패하면
//! 그때까지 올린 카운트를 모두 되돌립니다.

use flowmatic_core::{CmpOp, Value};

use crate::error::EngineError;
use crate::registry::{ProtoId, ProtocolTable};

use super::tree::{BranchOp, NodeId, NodeKind, Predicate, RuleTree};

/// 규칙 표현식을 트리로 파싱합니다.
///
/// `rule_id`는 에러 메시지에만 사용합니다.
pub fn parse_expression(
    rule_id: &str,
    text: &str,
    protocols: &ProtocolTable<'_>,
) -> Result<RuleTree, EngineError> {
    let mut parser = Parser {
        tokens: Vec::new(),
        pos: 0,
        tree: RuleTree::new(text.trim()),
        protocols,
        acquired: Vec::new(),
    };
    let result = tokenize(text).and_then(|tokens| {
        parser.tokens = tokens;
        parser.parse()
    });
    match result {
        Ok(root) => {
            parser.tree.set_root(Some(root.head));
            Ok(parser.tree)
        }
        Err(reason) => {
            for proto in parser.acquired.drain(..) {
                protocols.release(proto);
            }
            Err(EngineError::RuleParse {
                rule_id: rule_id.to_owned(),
                reason,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Pipe,
    Op(CmpOp),
    Word(String),
    Quoted(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::LParen => "'('".to_owned(),
            Self::RParen => "')'".to_owned(),
            Self::Pipe => "'|'".to_owned(),
            Self::Op(op) => format!("'{op}'"),
            Self::Word(w) => format!("'{w}'"),
            Self::Quoted(s) => format!("\"{s}\""),
        }
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Self::Word(w) if w == kw)
    }
}

const KEYWORDS: [&str; 3] = ["and", "or", "not"];

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '|' | '<' | '>' | '=' | '!' | '"')
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        match c {
            '(' | ')' | '|' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Pipe,
                });
            }
            '<' | '>' | '=' | '!' => {
                chars.next();
                let eq = chars.next_if(|&(_, n)| n == '=').is_some();
                let op = match (c, eq) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    ('>', true) => CmpOp::Ge,
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Neq,
                    _ => return Err(format!("invalid operator at offset {pos}")),
                };
                tokens.push(Token::Op(op));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, ch)) => s.push(ch),
                        None => return Err(format!("unterminated string starting at offset {pos}")),
                    }
                }
                tokens.push(Token::Quoted(s));
            }
            _ => {
                let mut word = String::new();
                while let Some((_, ch)) = chars.next_if(|&(_, ch)| is_word_char(ch)) {
                    word.push(ch);
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// 부분 체인. `last`의 `a`가 아직 비어 있어 뒤에 이어 붙일 수 있습니다.
#[derive(Debug, Clone, Copy)]
struct Fragment {
    head: NodeId,
    last: NodeId,
}

struct Parser<'t, 'p> {
    tokens: Vec<Token>,
    pos: usize,
    tree: RuleTree,
    protocols: &'t ProtocolTable<'p>,
    acquired: Vec<ProtoId>,
}

impl Parser<'_, '_> {
    fn parse(&mut self) -> Result<Fragment, String> {
        if self.tokens.is_empty() {
            return Err("empty expression".to_owned());
        }
        let root = self.expr()?;
        match self.peek() {
            None => Ok(root),
            Some(tok) => Err(format!("unexpected {}", tok.describe())),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_rparen(&mut self) -> Result<(), String> {
        match self.bump() {
            Some(Token::RParen) => Ok(()),
            Some(tok) => Err(format!("expected ')' but found {}", tok.describe())),
            None => Err("unmatched '('".to_owned()),
        }
    }

    fn expr(&mut self) -> Result<Fragment, String> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = self.branch(BranchOp::Or, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Fragment, String> {
        let mut left = self.seq()?;
        while self.eat_keyword("and") {
            let right = self.seq()?;
            left = self.branch(BranchOp::And, left, right);
        }
        Ok(left)
    }

    fn seq(&mut self) -> Result<Fragment, String> {
        let mut frag = self.unit()?;
        while self.eat(&Token::Pipe) {
            let next = self.unit()?;
            self.tree.link(frag.last, next.head);
            frag.last = next.last;
        }
        Ok(frag)
    }

    fn unit(&mut self) -> Result<Fragment, String> {
        if self.eat_keyword("not") {
            if self.eat(&Token::LParen) {
                let leaf = self.leaf(true)?;
                return match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(leaf)
                    }
                    Some(_) => Err("'not' can only negate a single protocol test".to_owned()),
                    None => Err("unmatched '('".to_owned()),
                };
            }
            return self.leaf(true);
        }
        if self.eat(&Token::LParen) {
            let inner = self.expr()?;
            self.expect_rparen()?;
            return Ok(inner);
        }
        self.leaf(false)
    }

    fn leaf(&mut self, not: bool) -> Result<Fragment, String> {
        let word = match self.bump() {
            Some(Token::Word(w)) if !KEYWORDS.contains(&w.as_str()) => w,
            Some(tok) => return Err(format!("expected protocol but found {}", tok.describe())),
            None => return Err("unexpected end of expression".to_owned()),
        };

        let op = match self.peek() {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        };
        let (proto_name, field_name) = match (op, word.split_once('.')) {
            (Some(_), Some((proto, field))) => (proto, Some(field)),
            (Some(_), None) => return Err(format!("'{word}' needs a field before the operator")),
            (None, Some(_)) => return Err(format!("missing comparison operator after '{word}'")),
            (None, None) => (word.as_str(), None),
        };

        let proto = self
            .protocols
            .lookup(proto_name)
            .ok_or_else(|| format!("unknown protocol '{proto_name}'"))?;

        let predicate = match (op, field_name) {
            (Some(op), Some(field_name)) => {
                self.pos += 1;
                let field = self
                    .protocols
                    .field_index(proto, field_name)
                    .ok_or_else(|| format!("protocol '{proto_name}' has no field '{field_name}'"))?;
                let kind = self
                    .protocols
                    .field_spec(proto, field)
                    .map(|spec| spec.kind)
                    .ok_or_else(|| format!("protocol '{proto_name}' has no field '{field_name}'"))?;
                let text = match self.bump() {
                    Some(Token::Word(w) | Token::Quoted(w)) => w,
                    Some(tok) => return Err(format!("expected value but found {}", tok.describe())),
                    None => return Err(format!("missing value after '{word} {op}'")),
                };
                let value = Value::parse(kind, &text).map_err(|e| e.to_string())?;
                Some(Predicate { field, op, value })
            }
            _ => None,
        };

        self.protocols.acquire(proto);
        self.acquired.push(proto);
        let id = self.tree.push(NodeKind::Leaf {
            proto,
            predicate,
            not,
        });
        Ok(Fragment { head: id, last: id })
    }

    fn branch(&mut self, op: BranchOp, left: Fragment, right: Fragment) -> Fragment {
        let tail = self.tree.push(NodeKind::Tail);
        self.tree.link(left.last, tail);
        self.tree.link(right.last, tail);
        let branch = self.tree.push(NodeKind::Branch { op, b: right.head });
        self.tree.link(branch, left.head);
        Fragment {
            head: branch,
            last: tail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProtocolRegistry;

    fn kinds(tree: &RuleTree) -> (usize, usize, usize) {
        let (mut leaves, mut branches, mut tails) = (0, 0, 0);
        tree.visit(|_, n| match n.kind() {
            NodeKind::Leaf { .. } => leaves += 1,
            NodeKind::Branch { .. } => branches += 1,
            NodeKind::Tail => tails += 1,
        });
        (leaves, branches, tails)
    }

    #[test]
    fn sequence_links_leaves_in_order() {
        let registry = ProtocolRegistry::with_builtin().unwrap();
        let protocols = registry.read();
        let tree = parse_expression("r", "ethernet | ipv4.src == 10.0.0.0/8 | tcp", &protocols).unwrap();
        assert_eq!(kinds(&tree), (3, 0, 0));

        let mut names = Vec::new();
        let mut cur = tree.root();
        while let Some(id) = cur {
            if let NodeKind::Leaf { proto, .. } = tree.node(id).kind() {
                names.push(protocols.name(*proto));
            }
            cur = tree.node(id).a();
        }
        assert_eq!(names, ["ethernet", "ipv4", "tcp"]);
        assert_eq!(protocols.refcount(protocols.lookup("ipv4").unwrap()), 1);
        tree.destroy(&protocols);
        assert_eq!(protocols.refcount(protocols.lookup("ipv4").unwrap()), 0);
    }

    #[test]
    fn nested_branches_share_tails() {
        let registry = ProtocolRegistry::with_builtin().unwrap();
        let protocols = registry.read();
        let tree = parse_expression("r", "ipv4 and (tcp or udp)", &protocols).unwrap();
        assert_eq!(kinds(&tree), (3, 2, 2));
        assert_eq!(tree.destroy(&protocols), 7);
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let registry = ProtocolRegistry::with_builtin().unwrap();
        let protocols = registry.read();
        let tree = parse_expression("r", "tcp or udp and icmp", &protocols).unwrap();
        let root = tree.root().unwrap();
        match tree.node(root).kind() {
            NodeKind::Branch { op, b } => {
                assert_eq!(*op, BranchOp::Or);
                assert!(matches!(
                    tree.node(*b).kind(),
                    NodeKind::Branch { op: BranchOp::And, .. }
                ));
            }
            other => panic!("unexpected root {other:?}"),
        }
        tree.destroy(&protocols);
    }

    #[test]
    fn negated_single_leaf_is_accepted() {
        let registry = ProtocolRegistry::with_builtin().unwrap();
        let protocols = registry.read();
        for text in ["not ipv6", "not (ipv6)", "ethernet | not ipv4.ttl < 5"] {
            let tree = parse_expression("r", text, &protocols).unwrap();
            tree.destroy(&protocols);
        }
    }

    #[test]
    fn parse_errors_release_references() {
        let registry = ProtocolRegistry::with_builtin().unwrap();
        let protocols = registry.read();
        let ipv4 = protocols.lookup("ipv4").unwrap();
        let cases = [
            "",
            "ipv4 and",
            "ipv4 | (tcp or udp",
            "not (ipv4 and tcp)",
            "not (ipv4 | tcp)",
            "ipv4 | nosuchproto",
            "ipv4.nosuchfield == 1",
            "ipv4.ttl = 3",
            "ipv4.ttl == notanumber",
            "ipv4.ttl",
            "ipv4 tcp",
            "ipv4 | \"open",
        ];
        for text in cases {
            let err = parse_expression("bad", text, &protocols).unwrap_err();
            assert!(matches!(err, EngineError::RuleParse { ref rule_id, .. } if rule_id == "bad"), "{text}");
            assert_eq!(protocols.refcount(ipv4), 0, "{text}");
        }
    }

    #[test]
    fn quoted_values_and_ipv6_literals() {
        let tokens = tokenize("ipv6.src == fe80::1 | tcp.dport >= 1024").unwrap();
        assert_eq!(tokens[2], Token::Word("fe80::1".to_owned()));
        assert_eq!(tokens[5], Token::Op(CmpOp::Ge));
        let tokens = tokenize("x.y != \"a b\"").unwrap();
        assert_eq!(tokens[2], Token::Quoted("a b".to_owned()));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_text_never_leaks_references(text in "[a-z0-9 .|()=!<>\"]{0,64}") {
                let registry = ProtocolRegistry::with_builtin().unwrap();
                let protocols = registry.read();
                if let Ok(tree) = parse_expression("p", &text, &protocols) {
                    tree.destroy(&protocols);
                }
                for info in protocols.list() {
                    prop_assert_eq!(info.refcount, 0, "{} leaked by {:?}", info.name, text);
                }
            }
        }
    }
}

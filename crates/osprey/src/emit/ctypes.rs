//! C spelling of representations and emission of type definitions: user
//! enums, structs, and tagged unions in topological order, plus generated
//! auxiliary types for tuples, lists, and vectors, each emitted at most once.
//!
//! Struct and union bodies are emitted first, then one block of helper
//! prototypes, then the helper bodies; forward struct declarations cover
//! every field that is a heap indirection, which is what makes recursive
//! definitions legal C.

use osprey_core::{CTyp, Id};

use crate::cir::CTypeDef;
use crate::zencode::zencode;

use super::Emitter;

/// The C type a representation occupies.
pub fn c_type(ctyp: &CTyp) -> String {
    match ctyp {
        CTyp::Unit => "unit".to_string(),
        CTyp::Bit => "fbits".to_string(),
        CTyp::Bool => "bool".to_string(),
        CTyp::String => "ostring".to_string(),
        CTyp::Real => "real".to_string(),
        CTyp::Enum(id, _) => format!("enum {}", zencode(id.as_str())),
        CTyp::FInt(_) => "int64_t".to_string(),
        CTyp::LInt => "lint".to_string(),
        CTyp::FBits(_, _) => "uint64_t".to_string(),
        CTyp::SBits(_, _) => "sbits".to_string(),
        CTyp::LBits(_) => "lbits".to_string(),
        CTyp::Tup(_) => format!("struct {}", struct_tag(ctyp)),
        CTyp::Struct(id, _) | CTyp::Variant(id, _) => {
            format!("struct {}", zencode(id.as_str()))
        }
        CTyp::List(_) => format!("struct {} *", struct_tag(ctyp)),
        CTyp::Vector(_, _) => format!("struct {}", struct_tag(ctyp)),
        CTyp::Ref(inner) => format!("{} *", c_type(inner)),
        CTyp::Poly(_) => "void *".to_string(),
    }
}

/// The struct tag of a generated auxiliary type.
pub fn struct_tag(ctyp: &CTyp) -> String {
    format!("z{}", ctyp.mangled())
}

/// Whether element values of this representation are returned by value or
/// written through an out-pointer by the generated pick/access helpers. Both
/// the list and vector code paths take the convention from this single
/// predicate, so they cannot disagree.
pub fn pick_convention_is_stack(elem: &CTyp) -> bool {
    elem.is_stack()
}

impl Emitter<'_> {
    /// Emit every user type definition (already topologically sorted) and
    /// the auxiliary types they embed. Helper functions are only gathered
    /// here; the driver writes them after the last type body, behind one
    /// prototype block, so any helper may call any other.
    pub(super) fn emit_type_defs(&mut self, type_defs: &[CTypeDef]) {
        for tdef in type_defs {
            match tdef {
                CTypeDef::Enum(id, members) => self.emit_enum_def(id, members),
                CTypeDef::Struct(id, fields) => self.emit_struct_def(id, fields),
                CTypeDef::Variant(id, ctors) => self.emit_variant_def(id, ctors),
            }
            self.defined_user.insert(tdef.id().clone());
        }
        self.flush_deferred_aux();
    }

    fn emit_enum_def(&mut self, id: &Id, members: &[Id]) {
        self.out.push_str(&format!("// enum {id}\n"));
        let spelled: Vec<String> = members
            .iter()
            .map(|member| zencode(member.as_str()))
            .collect();
        self.out.push_str(&format!(
            "enum {} {{ {} }};\n\n",
            zencode(id.as_str()),
            spelled.join(", ")
        ));
    }

    fn emit_struct_def(&mut self, id: &Id, fields: &[(Id, CTyp)]) {
        for (_, ctyp) in fields {
            self.ensure_field_type(ctyp);
        }
        self.out.push_str(&format!("// struct {id}\n"));
        self.out
            .push_str(&format!("struct {} {{\n", zencode(id.as_str())));
        for (field, ctyp) in fields {
            self.out.push_str(&format!(
                "  {} {};\n",
                c_type(ctyp),
                zencode(field.as_str())
            ));
        }
        self.out.push_str("};\n\n");

        let ctyp = CTyp::Struct(id.clone(), fields.to_vec());
        self.gather_struct_helpers(&c_type(&ctyp), &ctyp.mangled(), fields, false);
    }

    fn emit_variant_def(&mut self, id: &Id, ctors: &[(Id, CTyp)]) {
        for (_, ctyp) in ctors {
            self.ensure_field_type(ctyp);
        }
        let tag = zencode(id.as_str());
        self.out.push_str(&format!("// union {id}\n"));
        let kinds: Vec<String> = ctors
            .iter()
            .map(|(ctor, _)| format!("Kind_{}", zencode(ctor.as_str())))
            .collect();
        self.out
            .push_str(&format!("enum kind_{tag} {{ {} }};\n\n", kinds.join(", ")));
        self.out.push_str(&format!("struct {tag} {{\n"));
        self.out.push_str(&format!("  enum kind_{tag} kind;\n"));
        self.out.push_str("  union {\n");
        for (ctor, ctyp) in ctors {
            self.out.push_str(&format!(
                "    {} {};\n",
                c_type(ctyp),
                zencode(ctor.as_str())
            ));
        }
        self.out.push_str("  };\n};\n\n");

        self.gather_variant_helpers(id, ctors);
    }

    /// Make a field's type usable inside a struct body: auxiliary types
    /// embedded by value are fully emitted, heap indirections get a forward
    /// declaration now and their full definition later.
    fn ensure_field_type(&mut self, ctyp: &CTyp) {
        match ctyp {
            CTyp::Tup(items) => {
                for item in items {
                    self.ensure_field_type(item);
                }
                self.ensure_aux(ctyp);
            }
            CTyp::List(_) => {
                // Pointer field: a forward declaration is enough for now.
                let tag = struct_tag(ctyp);
                if !self.generated_aux.contains(&tag) && self.forward_declared.insert(tag.clone())
                {
                    self.out.push_str(&format!("struct {tag};\n\n"));
                }
                self.deferred_aux.push(ctyp.clone());
            }
            CTyp::Vector(_, elem) => {
                // Embedded by value; its own data pointer tolerates an
                // incomplete element.
                if let CTyp::Struct(id, _) | CTyp::Variant(id, _) = elem.as_ref() {
                    if !self.defined_user.contains(id) {
                        let tag = zencode(id.as_str());
                        if self.forward_declared.insert(tag.clone()) {
                            self.out.push_str(&format!("struct {tag};\n\n"));
                        }
                    }
                }
                self.ensure_aux(ctyp);
            }
            CTyp::Ref(inner) => self.ensure_field_type(inner),
            _ => {}
        }
    }

    /// Emit the auxiliary type for a tuple, list, or vector representation
    /// (and any auxiliary types it needs itself), exactly once per canonical
    /// spelling.
    pub(super) fn ensure_aux(&mut self, ctyp: &CTyp) {
        match ctyp {
            CTyp::Tup(items) => {
                let tag = struct_tag(ctyp);
                if self.generated_aux.contains(&tag) {
                    return;
                }
                for item in items {
                    self.ensure_aux(item);
                }
                self.generated_aux.insert(tag.clone());
                self.out.push_str(&format!("struct {tag} {{\n"));
                for (i, item) in items.iter().enumerate() {
                    self.out
                        .push_str(&format!("  {} ztup{i};\n", c_type(item)));
                }
                self.out.push_str("};\n\n");
                let fields: Vec<(Id, CTyp)> = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| (Id::new(format!("tup{i}")), item.clone()))
                    .collect();
                self.gather_struct_helpers(
                    &format!("struct {tag}"),
                    &ctyp.mangled(),
                    &fields,
                    true,
                );
            }
            CTyp::List(elem) => {
                let tag = struct_tag(ctyp);
                if self.generated_aux.contains(&tag) {
                    return;
                }
                self.ensure_aux(elem);
                self.generated_aux.insert(tag.clone());
                self.out.push_str(&format!(
                    "struct {tag} {{\n  {} hd;\n  struct {tag} *tl;\n}};\n\n",
                    c_type(elem)
                ));
                self.gather_list_helpers(ctyp, elem);
            }
            CTyp::Vector(_, elem) => {
                let tag = struct_tag(ctyp);
                if self.generated_aux.contains(&tag) {
                    return;
                }
                self.ensure_aux(elem);
                self.generated_aux.insert(tag.clone());
                self.out.push_str(&format!(
                    "struct {tag} {{\n  size_t len;\n  {} *data;\n}};\n\n",
                    c_type(elem)
                ));
                self.gather_vector_helpers(ctyp, elem);
            }
            CTyp::Ref(inner) => self.ensure_aux(inner),
            _ => {}
        }
    }

    pub(super) fn flush_deferred_aux(&mut self) {
        while let Some(ctyp) = self.deferred_aux.pop() {
            self.ensure_aux(&ctyp);
        }
    }

    // ── Helper function generation ───────────────────────────────────────────

    fn helper(&mut self, proto: String, body: String) {
        self.helper_protos.push(proto.clone());
        self.helper_bodies.push(format!("{proto}\n{body}"));
    }

    fn gather_struct_helpers(
        &mut self,
        cty: &str,
        mangled: &str,
        fields: &[(Id, CTyp)],
        tuple_fields: bool,
    ) {
        let access = |field: &Id| {
            if tuple_fields {
                format!("z{field}")
            } else {
                zencode(field.as_str())
            }
        };
        let heap_fields: Vec<&(Id, CTyp)> =
            fields.iter().filter(|(_, ctyp)| ctyp.is_heap()).collect();

        if !heap_fields.is_empty() {
            let mut create = String::from("{\n");
            let mut kill = String::from("{\n");
            for (field, ctyp) in &heap_fields {
                create.push_str(&format!(
                    "  CREATE({})(&rop->{});\n",
                    ctyp.mangled(),
                    access(field)
                ));
                kill.push_str(&format!(
                    "  KILL({})(&rop->{});\n",
                    ctyp.mangled(),
                    access(field)
                ));
            }
            create.push('}');
            kill.push('}');
            self.helper(format!("static void CREATE({mangled})({cty} *rop)"), create);
            self.helper(
                format!("static void RECREATE({mangled})({cty} *rop)"),
                String::from("{\n")
                    + &heap_fields
                        .iter()
                        .map(|(field, ctyp)| {
                            format!("  RECREATE({})(&rop->{});\n", ctyp.mangled(), access(field))
                        })
                        .collect::<String>()
                    + "}",
            );
            self.helper(format!("static void KILL({mangled})({cty} *rop)"), kill);

            let mut copy = String::from("{\n");
            for (field, ctyp) in fields {
                if ctyp.is_heap() {
                    copy.push_str(&format!(
                        "  COPY({})(&rop->{}, op.{});\n",
                        ctyp.mangled(),
                        access(field),
                        access(field)
                    ));
                } else {
                    copy.push_str(&format!(
                        "  rop->{} = op.{};\n",
                        access(field),
                        access(field)
                    ));
                }
            }
            copy.push('}');
            self.helper(
                format!("static void COPY({mangled})({cty} *rop, {cty} op)"),
                copy,
            );
        }

        let mut cmp: Vec<String> = Vec::new();
        for (field, ctyp) in fields {
            if ctyp.is_heap() || matches!(ctyp, CTyp::Struct(_, _) | CTyp::Tup(_)) {
                cmp.push(format!(
                    "EQUAL({})(op1.{}, op2.{})",
                    ctyp.mangled(),
                    access(field),
                    access(field)
                ));
            } else {
                cmp.push(format!("op1.{} == op2.{}", access(field), access(field)));
            }
        }
        if cmp.is_empty() {
            cmp.push("true".to_string());
        }
        self.helper(
            format!("static bool EQUAL({mangled})({cty} op1, {cty} op2)"),
            format!("{{\n  return {};\n}}", cmp.join(" && ")),
        );
    }

    fn gather_variant_helpers(&mut self, id: &Id, ctors: &[(Id, CTyp)]) {
        let tag = zencode(id.as_str());
        let cty = format!("struct {tag}");
        let mangled = CTyp::Variant(id.clone(), vec![]).mangled();
        let Some((first, _)) = ctors.first() else {
            return;
        };

        let (first_ctor, first_ctyp) = (zencode(first.as_str()), &ctors[0].1);
        let mut create = format!("{{\n  rop->kind = Kind_{first_ctor};\n");
        if first_ctyp.is_heap() {
            create.push_str(&format!(
                "  CREATE({})(&rop->{first_ctor});\n",
                first_ctyp.mangled()
            ));
        }
        create.push('}');
        self.helper(format!("static void CREATE({mangled})({cty} *rop)"), create);

        let mut kill = String::from("{\n  switch (rop->kind) {\n");
        for (ctor, ctyp) in ctors {
            let label = zencode(ctor.as_str());
            if ctyp.is_heap() {
                kill.push_str(&format!(
                    "  case Kind_{label}: KILL({})(&rop->{label}); break;\n",
                    ctyp.mangled()
                ));
            } else {
                kill.push_str(&format!("  case Kind_{label}: break;\n"));
            }
        }
        kill.push_str("  }\n}");
        self.helper(format!("static void KILL({mangled})({cty} *rop)"), kill);

        self.helper(
            format!("static void RECREATE({mangled})({cty} *rop)"),
            format!(
                "{{\n  KILL({mangled})(rop);\n  CREATE({mangled})(rop);\n}}"
            ),
        );

        let mut copy = String::from("{\n  KILL(");
        copy.push_str(&mangled);
        copy.push_str(")(rop);\n  rop->kind = op.kind;\n  switch (op.kind) {\n");
        for (ctor, ctyp) in ctors {
            let label = zencode(ctor.as_str());
            if ctyp.is_heap() {
                copy.push_str(&format!(
                    "  case Kind_{label}: CREATE({m})(&rop->{label}); COPY({m})(&rop->{label}, op.{label}); break;\n",
                    m = ctyp.mangled()
                ));
            } else {
                copy.push_str(&format!(
                    "  case Kind_{label}: rop->{label} = op.{label}; break;\n"
                ));
            }
        }
        copy.push_str("  }\n}");
        self.helper(
            format!("static void COPY({mangled})({cty} *rop, {cty} op)"),
            copy,
        );

        let mut equal = String::from("{\n  if (op1.kind != op2.kind) return false;\n  switch (op1.kind) {\n");
        for (ctor, ctyp) in ctors {
            let label = zencode(ctor.as_str());
            if ctyp.is_heap() || matches!(ctyp, CTyp::Struct(_, _) | CTyp::Tup(_)) {
                equal.push_str(&format!(
                    "  case Kind_{label}: return EQUAL({})(op1.{label}, op2.{label});\n",
                    ctyp.mangled()
                ));
            } else if matches!(ctyp, CTyp::Unit) {
                equal.push_str(&format!("  case Kind_{label}: return true;\n"));
            } else {
                equal.push_str(&format!(
                    "  case Kind_{label}: return op1.{label} == op2.{label};\n"
                ));
            }
        }
        equal.push_str("  }\n  return false;\n}");
        self.helper(
            format!("static bool EQUAL({mangled})({cty} op1, {cty} op2)"),
            equal,
        );

        // One constructor function per (by now monomorphic) constructor.
        for (ctor, ctyp) in ctors {
            let label = zencode(ctor.as_str());
            let mut body = format!("{{\n  KILL({mangled})(rop);\n  rop->kind = Kind_{label};\n");
            if ctyp.is_heap() {
                body.push_str(&format!(
                    "  CREATE({m})(&rop->{label});\n  COPY({m})(&rop->{label}, op);\n",
                    m = ctyp.mangled()
                ));
            } else {
                body.push_str(&format!("  rop->{label} = op;\n"));
            }
            body.push('}');
            self.helper(
                format!("static void {label}({cty} *rop, {} op)", c_type(ctyp)),
                body,
            );
        }
    }

    fn gather_list_helpers(&mut self, list: &CTyp, elem: &CTyp) {
        let tag = struct_tag(list);
        let cty = format!("struct {tag} *");
        let mangled = list.mangled();
        let em = elem.mangled();

        self.helper(
            format!("static void CREATE({mangled})({cty} *rop)"),
            "{\n  *rop = NULL;\n}".to_string(),
        );
        let mut kill = format!("{{\n  struct {tag} *node = *rop;\n  while (node != NULL) {{\n    struct {tag} *next = node->tl;\n");
        if elem.is_heap() {
            kill.push_str(&format!("    KILL({em})(&node->hd);\n"));
        }
        kill.push_str("    rts_free(node);\n    node = next;\n  }\n  *rop = NULL;\n}");
        self.helper(format!("static void KILL({mangled})({cty} *rop)"), kill);
        self.helper(
            format!("static void RECREATE({mangled})({cty} *rop)"),
            format!("{{\n  KILL({mangled})(rop);\n}}"),
        );

        let copy_elem = if elem.is_heap() {
            format!("CREATE({em})(&node->hd);\n    COPY({em})(&node->hd, op->hd);")
        } else {
            "node->hd = op->hd;".to_string()
        };
        self.helper(
            format!("static void COPY({mangled})({cty} *rop, struct {tag} *op)"),
            format!(
                "{{\n  KILL({mangled})(rop);\n  struct {tag} **tail = rop;\n  for (; op != NULL; op = op->tl) {{\n    struct {tag} *node = rts_alloc(sizeof(struct {tag}));\n    {copy_elem}\n    node->tl = NULL;\n    *tail = node;\n    tail = &node->tl;\n  }}\n}}"
            ),
        );

        let store = if elem.is_heap() {
            format!("CREATE({em})(&node->hd);\n  COPY({em})(&node->hd, hd);")
        } else {
            "node->hd = hd;".to_string()
        };
        self.helper(
            format!(
                "static void cons_{mangled}({cty} *rop, {} hd, struct {tag} *tl)",
                c_type(elem)
            ),
            format!(
                "{{\n  struct {tag} *node = rts_alloc(sizeof(struct {tag}));\n  {store}\n  node->tl = tl;\n  *rop = node;\n}}"
            ),
        );

        let equal = format!("{{\n  for (; op1 != NULL && op2 != NULL; op1 = op1->tl, op2 = op2->tl) {{\n    if (!{}) return false;\n  }}\n  return op1 == NULL && op2 == NULL;\n}}",
            elem_equal(elem, "op1->hd", "op2->hd"));
        self.helper(
            format!("static bool EQUAL({mangled})(struct {tag} *op1, struct {tag} *op2)"),
            equal,
        );

        // Head pick; the calling convention follows the element
        // representation, see pick_convention_is_stack.
        if pick_convention_is_stack(elem) {
            self.helper(
                format!("static {} pick_{mangled}(struct {tag} *op)", c_type(elem)),
                "{\n  return op->hd;\n}".to_string(),
            );
        } else {
            self.helper(
                format!(
                    "static void pick_{mangled}({} *rop, struct {tag} *op)",
                    c_type(elem)
                ),
                format!("{{\n  COPY({em})(rop, op->hd);\n}}"),
            );
        }
    }

    fn gather_vector_helpers(&mut self, vector: &CTyp, elem: &CTyp) {
        let tag = struct_tag(vector);
        let cty = format!("struct {tag}");
        let mangled = vector.mangled();
        let em = elem.mangled();

        self.helper(
            format!("static void CREATE({mangled})({cty} *rop)"),
            "{\n  rop->len = 0;\n  rop->data = NULL;\n}".to_string(),
        );
        let mut kill = String::from("{\n");
        if elem.is_heap() {
            kill.push_str(&format!(
                "  for (size_t i = 0; i < rop->len; i++) KILL({em})(&rop->data[i]);\n"
            ));
        }
        kill.push_str("  if (rop->data != NULL) rts_free(rop->data);\n  rop->len = 0;\n  rop->data = NULL;\n}");
        self.helper(format!("static void KILL({mangled})({cty} *rop)"), kill);
        self.helper(
            format!("static void RECREATE({mangled})({cty} *rop)"),
            format!("{{\n  KILL({mangled})(rop);\n}}"),
        );

        let copy_elem = if elem.is_heap() {
            format!("{{ CREATE({em})(&rop->data[i]); COPY({em})(&rop->data[i], op.data[i]); }}")
        } else {
            "rop->data[i] = op.data[i];".to_string()
        };
        self.helper(
            format!("static void COPY({mangled})({cty} *rop, {cty} op)"),
            format!(
                "{{\n  KILL({mangled})(rop);\n  rop->len = op.len;\n  rop->data = rts_alloc(op.len * sizeof(*rop->data));\n  for (size_t i = 0; i < op.len; i++) {copy_elem}\n}}"
            ),
        );

        let mut equal = String::from("{\n  if (op1.len != op2.len) return false;\n  for (size_t i = 0; i < op1.len; i++) {\n");
        equal.push_str(&format!(
            "    if (!{}) return false;\n  }}\n  return true;\n}}",
            elem_equal(elem, "op1.data[i]", "op2.data[i]")
        ));
        self.helper(
            format!("static bool EQUAL({mangled})({cty} op1, {cty} op2)"),
            equal,
        );

        // Element access; same convention rule as list picks.
        if pick_convention_is_stack(elem) {
            self.helper(
                format!(
                    "static {} vector_access_{mangled}({cty} op, int64_t n)",
                    c_type(elem)
                ),
                "{\n  return op.data[n];\n}".to_string(),
            );
        } else {
            self.helper(
                format!(
                    "static void vector_access_{mangled}({} *rop, {cty} op, int64_t n)",
                    c_type(elem)
                ),
                format!("{{\n  COPY({em})(rop, op.data[n]);\n}}"),
            );
        }
        let store_elem = if elem.is_heap() {
            format!("COPY({em})(&rop->data[n], elem);")
        } else {
            "rop->data[n] = elem;".to_string()
        };
        self.helper(
            format!(
                "static void vector_update_{mangled}({cty} *rop, int64_t n, {} elem)",
                c_type(elem)
            ),
            format!("{{\n  {store_elem}\n}}"),
        );
    }
}

fn elem_equal(elem: &CTyp, a: &str, b: &str) -> String {
    if elem.is_heap() || matches!(elem, CTyp::Struct(_, _) | CTyp::Tup(_)) {
        format!("EQUAL({})({a}, {b})", elem.mangled())
    } else {
        format!("{a} == {b}")
    }
}

/// Poison returned past the exception exit of a value-returning function;
/// never observed because the exception flag is checked first.
pub fn poison_value(ctyp: &CTyp) -> String {
    match ctyp {
        CTyp::Unit => "UNIT".to_string(),
        CTyp::Bool => "false".to_string(),
        CTyp::FInt(_) => "INT64_C(0xdeadc0de)".to_string(),
        CTyp::Bit | CTyp::FBits(_, _) => "UINT64_C(0xdeadc0de)".to_string(),
        CTyp::SBits(_, _) => "(sbits){ .len = 0, .bits = 0 }".to_string(),
        CTyp::Enum(_, members) => members
            .first()
            .map(|m| zencode(m.as_str()))
            .unwrap_or_else(|| "0".to_string()),
        other => format!("({}){{0}}", c_type(other)),
    }
}
